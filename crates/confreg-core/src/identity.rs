//! Identity bridge between anonymous sessions, password-recoverable guests and accounts.

use crate::clock::Clock;
use crate::error::RegistrationError;
use crate::storage::DocumentStore;
use crate::types::{GuestLookupRecord, PersonalInfo, Registration, UserProfile, GUEST_USER_ID};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MIN_GUEST_PASSWORD_LEN: usize = 6;

/// Identity returned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub is_anonymous: bool,
    pub email: Option<String>,
}

impl Identity {
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_anonymous: true,
            email: None,
        }
    }

    pub fn account(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_anonymous: false,
            email: Some(email.into()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("email-already-in-use")]
    EmailAlreadyInUse,
    #[error("weak-password")]
    WeakPassword,
    #[error("invalid-credential")]
    InvalidCredential,
    #[error("identity '{0}' is not anonymous")]
    NotAnonymous(String),
    #[error("identity '{0}' not found")]
    UnknownIdentity(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<IdentityError> for RegistrationError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::WeakPassword => Self::InvalidArgument(err.to_string()),
            IdentityError::InvalidCredential => Self::Unauthenticated(err.to_string()),
            IdentityError::EmailAlreadyInUse => Self::Conflict(err.to_string()),
            other => Self::Identity(other.to_string()),
        }
    }
}

/// External identity provider keyed by email and password.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_anonymously(&self) -> Result<Identity, IdentityError>;

    /// Upgrade an anonymous identity into a credentialed account in place.
    async fn link_anonymous(
        &self,
        anonymous_id: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, IdentityError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, IdentityError>;

    async fn email_exists(&self, email: &str) -> Result<bool, IdentityError>;

    /// Resolve a bearer token presented by a caller.
    async fn resolve_token(&self, token: &str) -> Result<Option<Identity>, IdentityError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityState {
    Anonymous,
    GuestPasswordSet,
    Linked,
}

/// The wizard's view of who is registering.
#[derive(Debug, Clone, Default)]
pub struct IdentitySession {
    identity: Option<Identity>,
    guest_password: Option<String>,
    linked: bool,
}

impl IdentitySession {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            guest_password: None,
            linked: false,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Signed in with a durable (non-anonymous) account.
    pub fn is_authenticated(&self) -> bool {
        self.identity
            .as_ref()
            .map(|identity| !identity.is_anonymous)
            .unwrap_or(false)
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity
            .as_ref()
            .map(|identity| identity.is_anonymous)
            .unwrap_or(false)
    }

    /// Id stored on registrations: the session identity, or the guest sentinel.
    pub fn user_id(&self) -> String {
        self.identity
            .as_ref()
            .map(|identity| identity.id.clone())
            .unwrap_or_else(|| GUEST_USER_ID.to_string())
    }

    pub fn guest_password(&self) -> Option<&str> {
        self.guest_password.as_deref()
    }

    /// `None` while no identity exists yet; accounts that were never anonymous count as linked.
    pub fn state(&self) -> Option<IdentityState> {
        let identity = self.identity.as_ref()?;
        Some(if self.linked || !identity.is_anonymous {
            IdentityState::Linked
        } else if self.guest_password.is_some() {
            IdentityState::GuestPasswordSet
        } else {
            IdentityState::Anonymous
        })
    }
}

/// Result of the payment-time upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked(Identity),
    StayedGuest { reason: String },
    NotAttempted,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Salted transform for the guest lookup record. Low assurance; not a credential store.
pub fn hash_guest_password(password: &str, salt: &str) -> String {
    blake3::hash(format!("{salt}:{password}").as_bytes())
        .to_hex()
        .to_string()
}

pub struct IdentityBridge {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl IdentityBridge {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
        }
    }

    /// Start an anonymous session when the flow needs to proceed without one.
    pub async fn ensure_session(
        &self,
        session: &mut IdentitySession,
    ) -> Result<(), RegistrationError> {
        if session.identity.is_none() {
            let identity = self.provider.sign_in_anonymously().await?;
            debug!(identity = %identity.id, "anonymous session started");
            session.identity = Some(identity);
        }
        Ok(())
    }

    pub async fn check_email_exists(&self, email: &str) -> Result<bool, RegistrationError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(RegistrationError::invalid("email is required"));
        }
        Ok(self.provider.email_exists(&email).await?)
    }

    /// Capture a guest password and persist its salted hash in the guest lookup record.
    pub async fn set_guest_password(
        &self,
        session: &mut IdentitySession,
        email: &str,
        conference_id: &str,
        password: &str,
    ) -> Result<(), RegistrationError> {
        if password.chars().count() < MIN_GUEST_PASSWORD_LEN {
            return Err(RegistrationError::invalid(
                "guest password must be at least 6 characters",
            ));
        }
        let email = normalize_email(email);
        let now = self.clock.now();
        let existing = self.store.get_guest_record(&email, conference_id).await?;
        let salt = generate_salt();

        let record = GuestLookupRecord {
            email: email.clone(),
            conference_id: conference_id.to_string(),
            registration_id: existing.as_ref().and_then(|r| r.registration_id.clone()),
            password_hash: hash_guest_password(password, &salt),
            salt,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.put_guest_record(&record).await?;
        session.guest_password = Some(password.to_string());
        Ok(())
    }

    /// Point the guest lookup record at the registration it recovers.
    pub async fn attach_guest_registration(
        &self,
        email: &str,
        conference_id: &str,
        registration_id: &str,
    ) -> Result<(), RegistrationError> {
        let email = normalize_email(email);
        if let Some(mut record) = self.store.get_guest_record(&email, conference_id).await? {
            record.registration_id = Some(registration_id.to_string());
            record.updated_at = self.clock.now();
            self.store.put_guest_record(&record).await?;
        }
        Ok(())
    }

    /// Try to upgrade an anonymous session into an account before payment.
    ///
    /// Never fails the payment flow: any provider or store error leaves the attendee a guest.
    pub async fn link_for_payment(
        &self,
        session: &mut IdentitySession,
        registration: &mut Registration,
        info: &PersonalInfo,
    ) -> LinkOutcome {
        let (Some(identity), Some(password)) = (session.identity.clone(), session.guest_password.clone())
        else {
            return LinkOutcome::NotAttempted;
        };
        if !identity.is_anonymous {
            return LinkOutcome::NotAttempted;
        }

        let email = normalize_email(&info.email);
        let linked = match self
            .provider
            .link_anonymous(&identity.id, &email, &password)
            .await
        {
            Ok(linked) => linked,
            Err(err) => {
                warn!(
                    identity = %identity.id,
                    registration_id = %registration.id,
                    error = %err,
                    "account linking failed; continuing as guest"
                );
                return LinkOutcome::StayedGuest {
                    reason: err.to_string(),
                };
            }
        };

        let now = self.clock.now();
        registration.user_id = linked.id.clone();
        registration.anonymous = false;
        registration.updated_at = now;
        if let Err(err) = self.store.put_registration(registration).await {
            warn!(
                registration_id = %registration.id,
                error = %err,
                "registration owner update after linking failed"
            );
        }

        let profile = UserProfile {
            id: linked.id.clone(),
            email,
            name: info.name.clone(),
            phone: Some(info.phone.clone()).filter(|p| !p.is_empty()),
            affiliation: info.affiliation.clone(),
            created_at: now,
        };
        if let Err(err) = self.store.put_profile(&profile).await {
            warn!(identity = %linked.id, error = %err, "profile creation after linking failed");
        }

        info!(identity = %linked.id, registration_id = %registration.id, "anonymous session linked");
        session.identity = Some(linked.clone());
        session.linked = true;
        LinkOutcome::Linked(linked)
    }

    /// Recover a guest registration from (email, password, conference).
    ///
    /// Unknown email, wrong password and missing registration are reported identically.
    pub async fn resume_guest_registration(
        &self,
        email: &str,
        password: &str,
        conference_id: &str,
    ) -> Result<Registration, RegistrationError> {
        let not_found =
            || RegistrationError::NotFound("no guest registration matches these details".to_string());
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() || conference_id.trim().is_empty() {
            return Err(RegistrationError::invalid(
                "email, password and conferenceId are required",
            ));
        }

        let record = self
            .store
            .get_guest_record(&email, conference_id)
            .await?
            .ok_or_else(not_found)?;
        if hash_guest_password(password, &record.salt) != record.password_hash {
            debug!(conference_id = conference_id, "guest password mismatch");
            return Err(not_found());
        }

        let registration_id = record.registration_id.ok_or_else(not_found)?;
        let registration = self
            .store
            .get_registration(&registration_id)
            .await?
            .ok_or_else(not_found)?;
        if registration.conference_id != conference_id {
            return Err(not_found());
        }
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryDocumentStore;
    use crate::types::{Conference, Grade};
    use crate::testing::FakeIdentityProvider;
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ))
    }

    fn registration(user_id: &str) -> Registration {
        let conference = Conference {
            id: "conf-1".to_string(),
            org_id: "org1".to_string(),
            slug: "spring".to_string(),
            title: "Spring".to_string(),
            order_prefix: "KSA".to_string(),
            periods: vec![],
            grades: vec![],
            consent_clauses: vec![],
        };
        let mut registration = Registration::new_pending(
            &conference,
            user_id,
            &Grade::new("g", "NON_MEMBER", "Non-member"),
            0,
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        );
        registration.anonymous = true;
        registration
    }

    fn info() -> PersonalInfo {
        PersonalInfo {
            name: "Kim".to_string(),
            email: "Kim@Example.org".to_string(),
            phone: "010-0000-0000".to_string(),
            affiliation: None,
            license_number: None,
        }
    }

    #[tokio::test]
    async fn session_moves_through_identity_states() {
        let store = Arc::new(MemoryDocumentStore::new());
        let bridge = IdentityBridge::new(Arc::new(FakeIdentityProvider::default()), store.clone(), clock());
        let mut session = IdentitySession::empty();
        assert_eq!(session.state(), None);
        assert_eq!(session.user_id(), GUEST_USER_ID);

        bridge.ensure_session(&mut session).await.unwrap();
        assert_eq!(session.state(), Some(IdentityState::Anonymous));

        bridge
            .set_guest_password(&mut session, "kim@example.org", "conf-1", "secret1")
            .await
            .unwrap();
        assert_eq!(session.state(), Some(IdentityState::GuestPasswordSet));

        let mut reg = registration(&session.user_id());
        let outcome = bridge.link_for_payment(&mut session, &mut reg, &info()).await;
        assert!(matches!(outcome, LinkOutcome::Linked(_)));
        assert_eq!(session.state(), Some(IdentityState::Linked));
        assert!(!reg.anonymous);
        assert!(store.get_profile(&reg.user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn linking_failure_keeps_guest_identity() {
        let store = Arc::new(MemoryDocumentStore::new());
        let provider = FakeIdentityProvider::failing_link(IdentityError::EmailAlreadyInUse);
        let bridge = IdentityBridge::new(Arc::new(provider), store, clock());
        let mut session = IdentitySession::with_identity(Identity::anonymous("anon-7"));
        bridge
            .set_guest_password(&mut session, "kim@example.org", "conf-1", "secret1")
            .await
            .unwrap();

        let mut reg = registration("anon-7");
        let outcome = bridge.link_for_payment(&mut session, &mut reg, &info()).await;
        assert_eq!(
            outcome,
            LinkOutcome::StayedGuest {
                reason: "email-already-in-use".to_string()
            }
        );
        assert_eq!(reg.user_id, "anon-7");
        assert!(reg.is_guest());
        assert_eq!(session.state(), Some(IdentityState::GuestPasswordSet));
    }

    #[tokio::test]
    async fn linking_is_skipped_without_password() {
        let bridge = IdentityBridge::new(
            Arc::new(FakeIdentityProvider::default()),
            Arc::new(MemoryDocumentStore::new()),
            clock(),
        );
        let mut session = IdentitySession::with_identity(Identity::anonymous("anon-1"));
        let mut reg = registration("anon-1");
        assert_eq!(
            bridge.link_for_payment(&mut session, &mut reg, &info()).await,
            LinkOutcome::NotAttempted
        );
    }

    #[tokio::test]
    async fn guest_can_resume_with_matching_password_only() {
        let store = Arc::new(MemoryDocumentStore::new());
        let bridge = IdentityBridge::new(Arc::new(FakeIdentityProvider::default()), store.clone(), clock());
        let mut session = IdentitySession::with_identity(Identity::anonymous("anon-1"));
        bridge
            .set_guest_password(&mut session, " KIM@example.org ", "conf-1", "secret1")
            .await
            .unwrap();

        let reg = registration("anon-1");
        store.put_registration(&reg).await.unwrap();
        bridge
            .attach_guest_registration("kim@example.org", "conf-1", &reg.id)
            .await
            .unwrap();

        let resumed = bridge
            .resume_guest_registration("kim@example.org", "secret1", "conf-1")
            .await
            .unwrap();
        assert_eq!(resumed.id, reg.id);

        let wrong = bridge
            .resume_guest_registration("kim@example.org", "secret2", "conf-1")
            .await
            .unwrap_err();
        assert_eq!(wrong.code(), "not-found");

        let other_conf = bridge
            .resume_guest_registration("kim@example.org", "secret1", "conf-2")
            .await
            .unwrap_err();
        assert_eq!(other_conf.code(), "not-found");
    }

    #[tokio::test]
    async fn short_guest_password_is_rejected() {
        let bridge = IdentityBridge::new(
            Arc::new(FakeIdentityProvider::default()),
            Arc::new(MemoryDocumentStore::new()),
            clock(),
        );
        let mut session = IdentitySession::empty();
        let err = bridge
            .set_guest_password(&mut session, "a@b.c", "conf-1", "123")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
    }

    #[test]
    fn guest_hash_depends_on_salt() {
        let a = hash_guest_password("secret1", "salt-a");
        let b = hash_guest_password("secret1", "salt-b");
        assert_ne!(a, b);
        assert_eq!(a, hash_guest_password("secret1", "salt-a"));
        assert_eq!(generate_salt().len(), 32);
    }
}
