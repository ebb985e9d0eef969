//! Fakes shared by the unit tests of this crate.

use crate::error::RegistrationError;
use crate::gateway::{ApprovalRequest, GatewayAdapter, InitiationContext, PaymentInitiation, PaymentResult};
use crate::identity::{Identity, IdentityError, IdentityProvider};
use crate::storage::{ClaimOutcome, CredentialKeyField, DocumentStore, MemoryDocumentStore};
use crate::types::{
    Conference, Credential, GuestLookupRecord, Organization, ParticipationHistoryEntry,
    PhoneCodeRecord, Registration, UserProfile, WizardDraft,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct FakeIdentityProvider {
    pub accounts: Mutex<HashSet<String>>,
    pub link_error: Option<IdentityError>,
    pub tokens: HashMap<String, Identity>,
    counter: Mutex<u32>,
}

impl FakeIdentityProvider {
    pub fn failing_link(err: IdentityError) -> Self {
        Self {
            link_error: Some(err),
            ..Self::default()
        }
    }

    pub async fn with_account(email: &str) -> Self {
        let provider = Self::default();
        provider.accounts.lock().await.insert(email.to_string());
        provider
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in_anonymously(&self) -> Result<Identity, IdentityError> {
        let mut counter = self.counter.lock().await;
        *counter += 1;
        Ok(Identity::anonymous(format!("anon-{}", *counter)))
    }

    async fn link_anonymous(
        &self,
        anonymous_id: &str,
        email: &str,
        _password: &str,
    ) -> Result<Identity, IdentityError> {
        if let Some(err) = &self.link_error {
            return Err(err.clone());
        }
        if !self.accounts.lock().await.insert(email.to_string()) {
            return Err(IdentityError::EmailAlreadyInUse);
        }
        Ok(Identity::account(anonymous_id, email))
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> Result<Identity, IdentityError> {
        Err(IdentityError::InvalidCredential)
    }

    async fn email_exists(&self, email: &str) -> Result<bool, IdentityError> {
        Ok(self.accounts.lock().await.contains(email))
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// Gateway answering every approval with a fixed result.
pub struct ScriptedGateway {
    pub result: PaymentResult,
}

#[async_trait]
impl GatewayAdapter for ScriptedGateway {
    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn initiate(
        &self,
        registration: &Registration,
        _context: &InitiationContext,
    ) -> Result<PaymentInitiation, RegistrationError> {
        Ok(PaymentInitiation::Redirect {
            url: format!("https://pay.example/{}", registration.order_id),
        })
    }

    async fn approve(&self, _request: &ApprovalRequest) -> PaymentResult {
        self.result.clone()
    }
}

/// Memory store that can be told to fail credential claims or draft saves.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryDocumentStore,
    fail_claims: bool,
    fail_drafts: bool,
}

impl FaultyStore {
    pub fn failing_claims() -> Self {
        Self {
            fail_claims: true,
            ..Self::default()
        }
    }

    pub fn failing_drafts() -> Self {
        Self {
            fail_drafts: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    fn backend_label(&self) -> &'static str {
        "faulty"
    }
    async fn put_organization(&self, o: &Organization) -> Result<(), RegistrationError> {
        self.inner.put_organization(o).await
    }
    async fn list_allowed_origins(&self) -> Result<Vec<String>, RegistrationError> {
        self.inner.list_allowed_origins().await
    }
    async fn get_conference(&self, id: &str) -> Result<Option<Conference>, RegistrationError> {
        self.inner.get_conference(id).await
    }
    async fn put_conference(&self, c: &Conference) -> Result<(), RegistrationError> {
        self.inner.put_conference(c).await
    }
    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, RegistrationError> {
        self.inner.get_registration(id).await
    }
    async fn put_registration(&self, r: &Registration) -> Result<(), RegistrationError> {
        self.inner.put_registration(r).await
    }
    async fn find_registrations(
        &self,
        user_id: &str,
        conference_id: &str,
    ) -> Result<Vec<Registration>, RegistrationError> {
        self.inner.find_registrations(user_id, conference_id).await
    }
    async fn put_credential(&self, c: &Credential) -> Result<(), RegistrationError> {
        self.inner.put_credential(c).await
    }
    async fn get_credential(
        &self,
        org_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        self.inner.get_credential(org_id, credential_id).await
    }
    async fn find_credential(
        &self,
        org_id: &str,
        field: CredentialKeyField,
        name: &str,
        code: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        self.inner.find_credential(org_id, field, name, code).await
    }
    async fn claim_credential(
        &self,
        org_id: &str,
        credential_id: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RegistrationError> {
        if self.fail_claims {
            return Err(RegistrationError::Store("credential collection unavailable".to_string()));
        }
        self.inner.claim_credential(org_id, credential_id, claimant, now).await
    }
    async fn save_draft(&self, d: &WizardDraft) -> Result<(), RegistrationError> {
        if self.fail_drafts {
            return Err(RegistrationError::Store("draft collection unavailable".to_string()));
        }
        self.inner.save_draft(d).await
    }
    async fn load_draft(&self, key: &str) -> Result<Option<WizardDraft>, RegistrationError> {
        self.inner.load_draft(key).await
    }
    async fn put_guest_record(&self, r: &GuestLookupRecord) -> Result<(), RegistrationError> {
        self.inner.put_guest_record(r).await
    }
    async fn get_guest_record(
        &self,
        email: &str,
        conference_id: &str,
    ) -> Result<Option<GuestLookupRecord>, RegistrationError> {
        self.inner.get_guest_record(email, conference_id).await
    }
    async fn put_profile(&self, p: &UserProfile) -> Result<(), RegistrationError> {
        self.inner.put_profile(p).await
    }
    async fn get_profile(&self, id: &str) -> Result<Option<UserProfile>, RegistrationError> {
        self.inner.get_profile(id).await
    }
    async fn append_history(
        &self,
        user_id: &str,
        entry: &ParticipationHistoryEntry,
    ) -> Result<bool, RegistrationError> {
        self.inner.append_history(user_id, entry).await
    }
    async fn list_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipationHistoryEntry>, RegistrationError> {
        self.inner.list_history(user_id).await
    }
    async fn put_phone_code(&self, r: &PhoneCodeRecord) -> Result<(), RegistrationError> {
        self.inner.put_phone_code(r).await
    }
    async fn get_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneCodeRecord>, RegistrationError> {
        self.inner.get_phone_code(phone).await
    }
    async fn delete_phone_code(&self, phone: &str) -> Result<(), RegistrationError> {
        self.inner.delete_phone_code(phone).await
    }
}
