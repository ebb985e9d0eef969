use crate::error::RegistrationError;
use crate::types::{
    Conference, Credential, GuestLookupRecord, Organization, ParticipationHistoryEntry,
    PhoneCodeRecord, Registration, UserProfile, WizardDraft,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Roster schemas vary between organizations; a code may live in either field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKeyField {
    LicenseNumber,
    Code,
}

impl CredentialKeyField {
    /// Lookup order used by verification.
    pub const LOOKUP_ORDER: [CredentialKeyField; 2] = [Self::LicenseNumber, Self::Code];

    pub fn field_name(self) -> &'static str {
        match self {
            Self::LicenseNumber => "license_number",
            Self::Code => "code",
        }
    }

    fn read(self, credential: &Credential) -> Option<&str> {
        match self {
            Self::LicenseNumber => credential.license_number.as_deref(),
            Self::Code => credential.code.as_deref(),
        }
    }
}

/// Why a credential is being claimed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimReason {
    Verification,
    Payment,
}

/// Result of a compare-and-swap claim on `(used, used_by)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Credential),
    AlreadyOwned(Credential),
    HeldByOther { used_by: String },
    Expired,
    NotFound,
}

/// Decide a claim against the current credential state. Shared by every backend.
fn decide_claim(
    credential: &Credential,
    claimant: &str,
    now: DateTime<Utc>,
) -> (ClaimOutcome, Option<Credential>) {
    if credential.is_expired(now) {
        return (ClaimOutcome::Expired, None);
    }
    if credential.used {
        return match credential.used_by.as_deref() {
            Some(owner) if owner == claimant => {
                (ClaimOutcome::AlreadyOwned(credential.clone()), None)
            }
            owner => (
                ClaimOutcome::HeldByOther {
                    used_by: owner.unwrap_or_default().to_string(),
                },
                None,
            ),
        };
    }

    let mut updated = credential.clone();
    updated.used = true;
    updated.used_by = Some(claimant.to_string());
    updated.used_at = Some(now);
    (ClaimOutcome::Claimed(updated.clone()), Some(updated))
}

/// Document store boundary consumed by the registration pipeline.
///
/// Only single-document atomic updates are assumed; `claim_credential` is the one
/// check-then-write the backend must perform atomically for a single credential.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn put_organization(&self, organization: &Organization) -> Result<(), RegistrationError>;
    async fn list_allowed_origins(&self) -> Result<Vec<String>, RegistrationError>;

    async fn get_conference(&self, id: &str) -> Result<Option<Conference>, RegistrationError>;
    async fn put_conference(&self, conference: &Conference) -> Result<(), RegistrationError>;

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, RegistrationError>;
    async fn put_registration(&self, registration: &Registration) -> Result<(), RegistrationError>;
    async fn find_registrations(
        &self,
        user_id: &str,
        conference_id: &str,
    ) -> Result<Vec<Registration>, RegistrationError>;

    async fn put_credential(&self, credential: &Credential) -> Result<(), RegistrationError>;
    async fn get_credential(
        &self,
        org_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credential>, RegistrationError>;
    async fn find_credential(
        &self,
        org_id: &str,
        field: CredentialKeyField,
        name: &str,
        code: &str,
    ) -> Result<Option<Credential>, RegistrationError>;
    async fn claim_credential(
        &self,
        org_id: &str,
        credential_id: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RegistrationError>;

    async fn save_draft(&self, draft: &WizardDraft) -> Result<(), RegistrationError>;
    async fn load_draft(&self, key: &str) -> Result<Option<WizardDraft>, RegistrationError>;

    async fn put_guest_record(&self, record: &GuestLookupRecord) -> Result<(), RegistrationError>;
    async fn get_guest_record(
        &self,
        email: &str,
        conference_id: &str,
    ) -> Result<Option<GuestLookupRecord>, RegistrationError>;

    async fn put_profile(&self, profile: &UserProfile) -> Result<(), RegistrationError>;
    async fn get_profile(&self, id: &str) -> Result<Option<UserProfile>, RegistrationError>;

    /// Append a history entry once per registration id. Returns `false` if it already existed.
    async fn append_history(
        &self,
        user_id: &str,
        entry: &ParticipationHistoryEntry,
    ) -> Result<bool, RegistrationError>;
    async fn list_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipationHistoryEntry>, RegistrationError>;

    async fn put_phone_code(&self, record: &PhoneCodeRecord) -> Result<(), RegistrationError>;
    async fn get_phone_code(&self, phone: &str)
        -> Result<Option<PhoneCodeRecord>, RegistrationError>;
    async fn delete_phone_code(&self, phone: &str) -> Result<(), RegistrationError>;
}

/// Document store backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Keep every collection in process memory only.
    #[default]
    Memory,
    /// Persist documents as JSONB rows in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Build the configured store, creating the postgres schema when needed.
pub async fn bootstrap_store(
    config: StoreConfig,
) -> Result<Arc<dyn DocumentStore>, RegistrationError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryDocumentStore::new())),
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresDocumentStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, Default)]
struct MemoryCollections {
    organizations: HashMap<String, Organization>,
    conferences: HashMap<String, Conference>,
    registrations: HashMap<String, Registration>,
    credentials: HashMap<(String, String), Credential>,
    drafts: HashMap<String, WizardDraft>,
    guests: HashMap<(String, String), GuestLookupRecord>,
    profiles: HashMap<String, UserProfile>,
    history: HashMap<String, Vec<ParticipationHistoryEntry>>,
    phone_codes: HashMap<String, PhoneCodeRecord>,
}

/// In-process store. Every operation takes the single collection lock, so claims are serialized.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<MemoryCollections>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn put_organization(&self, organization: &Organization) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner
            .organizations
            .insert(organization.id.clone(), organization.clone());
        Ok(())
    }

    async fn list_allowed_origins(&self) -> Result<Vec<String>, RegistrationError> {
        let inner = self.inner.read().await;
        let mut origins: Vec<String> = inner
            .organizations
            .values()
            .flat_map(|org| org.domains.iter().cloned())
            .collect();
        origins.sort();
        origins.dedup();
        Ok(origins)
    }

    async fn get_conference(&self, id: &str) -> Result<Option<Conference>, RegistrationError> {
        Ok(self.inner.read().await.conferences.get(id).cloned())
    }

    async fn put_conference(&self, conference: &Conference) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner
            .conferences
            .insert(conference.id.clone(), conference.clone());
        Ok(())
    }

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, RegistrationError> {
        Ok(self.inner.read().await.registrations.get(id).cloned())
    }

    async fn put_registration(&self, registration: &Registration) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner
            .registrations
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn find_registrations(
        &self,
        user_id: &str,
        conference_id: &str,
    ) -> Result<Vec<Registration>, RegistrationError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Registration> = inner
            .registrations
            .values()
            .filter(|r| r.user_id == user_id && r.conference_id == conference_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner.credentials.insert(
            (credential.org_id.clone(), credential.id.clone()),
            credential.clone(),
        );
        Ok(())
    }

    async fn get_credential(
        &self,
        org_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .credentials
            .get(&(org_id.to_string(), credential_id.to_string()))
            .cloned())
    }

    async fn find_credential(
        &self,
        org_id: &str,
        field: CredentialKeyField,
        name: &str,
        code: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .credentials
            .values()
            .find(|c| c.org_id == org_id && c.name == name && field.read(c) == Some(code))
            .cloned())
    }

    async fn claim_credential(
        &self,
        org_id: &str,
        credential_id: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RegistrationError> {
        let mut inner = self.inner.write().await;
        let key = (org_id.to_string(), credential_id.to_string());
        let Some(current) = inner.credentials.get(&key) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let (outcome, update) = decide_claim(current, claimant, now);
        if let Some(updated) = update {
            inner.credentials.insert(key, updated);
        }
        Ok(outcome)
    }

    async fn save_draft(&self, draft: &WizardDraft) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner.drafts.insert(draft.draft_key.clone(), draft.clone());
        Ok(())
    }

    async fn load_draft(&self, key: &str) -> Result<Option<WizardDraft>, RegistrationError> {
        Ok(self.inner.read().await.drafts.get(key).cloned())
    }

    async fn put_guest_record(&self, record: &GuestLookupRecord) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner.guests.insert(
            (record.email.clone(), record.conference_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_guest_record(
        &self,
        email: &str,
        conference_id: &str,
    ) -> Result<Option<GuestLookupRecord>, RegistrationError> {
        let inner = self.inner.read().await;
        Ok(inner
            .guests
            .get(&(email.to_string(), conference_id.to_string()))
            .cloned())
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner.profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn get_profile(&self, id: &str) -> Result<Option<UserProfile>, RegistrationError> {
        Ok(self.inner.read().await.profiles.get(id).cloned())
    }

    async fn append_history(
        &self,
        user_id: &str,
        entry: &ParticipationHistoryEntry,
    ) -> Result<bool, RegistrationError> {
        let mut inner = self.inner.write().await;
        let entries = inner.history.entry(user_id.to_string()).or_default();
        if entries
            .iter()
            .any(|existing| existing.registration_id == entry.registration_id)
        {
            return Ok(false);
        }
        entries.push(entry.clone());
        Ok(true)
    }

    async fn list_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipationHistoryEntry>, RegistrationError> {
        let inner = self.inner.read().await;
        Ok(inner.history.get(user_id).cloned().unwrap_or_default())
    }

    async fn put_phone_code(&self, record: &PhoneCodeRecord) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().await;
        inner
            .phone_codes
            .insert(record.phone.clone(), record.clone());
        Ok(())
    }

    async fn get_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneCodeRecord>, RegistrationError> {
        Ok(self.inner.read().await.phone_codes.get(phone).cloned())
    }

    async fn delete_phone_code(&self, phone: &str) -> Result<(), RegistrationError> {
        self.inner.write().await.phone_codes.remove(phone);
        Ok(())
    }
}

const ORGANIZATIONS: &str = "organizations";
const CONFERENCES: &str = "conferences";
const REGISTRATIONS: &str = "registrations";
const CREDENTIALS: &str = "credentials";
const DRAFTS: &str = "drafts";
const GUESTS: &str = "guests";
const PROFILES: &str = "profiles";
const HISTORY: &str = "history";
const PHONE_CODES: &str = "phone_codes";

/// PostgreSQL-backed document store.
///
/// Every collection shares one JSONB table keyed by `(collection, doc_id)`; `owner`
/// scopes sub-collections such as per-account history.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RegistrationError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| RegistrationError::Store(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), RegistrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS confreg_documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                owner TEXT NULL,
                body JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_confreg_documents_owner ON confreg_documents (collection, owner)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<T>, RegistrationError> {
        let row = sqlx::query("SELECT body FROM confreg_documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RegistrationError::Store(format!("postgres read {collection} failed: {e}")))?;

        row.map(|row| decode_body(collection, &row)).transpose()
    }

    async fn put_doc<T: Serialize>(
        &self,
        collection: &str,
        doc_id: &str,
        owner: Option<&str>,
        value: &T,
    ) -> Result<(), RegistrationError> {
        let body = serde_json::to_value(value)?;
        sqlx::query(
            r#"
            INSERT INTO confreg_documents (collection, doc_id, owner, body, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (collection, doc_id)
            DO UPDATE SET owner = EXCLUDED.owner, body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(collection)
        .bind(doc_id)
        .bind(owner)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres write {collection} failed: {e}")))?;
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, doc_id: &str) -> Result<(), RegistrationError> {
        sqlx::query("DELETE FROM confreg_documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RegistrationError::Store(format!("postgres delete {collection} failed: {e}"))
            })?;
        Ok(())
    }

    async fn list_docs<T: DeserializeOwned>(
        &self,
        collection: &str,
        owner: Option<&str>,
    ) -> Result<Vec<T>, RegistrationError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM confreg_documents
            WHERE collection = $1 AND ($2::TEXT IS NULL OR owner = $2)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(collection)
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres list {collection} failed: {e}")))?;

        rows.iter().map(|row| decode_body(collection, row)).collect()
    }
}

fn decode_body<T: DeserializeOwned>(
    collection: &str,
    row: &sqlx::postgres::PgRow,
) -> Result<T, RegistrationError> {
    let body: serde_json::Value = row.try_get("body").map_err(|e| {
        RegistrationError::Store(format!("postgres decode {collection} body failed: {e}"))
    })?;
    serde_json::from_value(body).map_err(|e| {
        RegistrationError::Serialization(format!("{collection} document decode failed: {e}"))
    })
}

fn credential_doc_id(org_id: &str, credential_id: &str) -> String {
    format!("{org_id}/{credential_id}")
}

fn guest_doc_id(email: &str, conference_id: &str) -> String {
    format!("{conference_id}/{email}")
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn put_organization(&self, organization: &Organization) -> Result<(), RegistrationError> {
        self.put_doc(ORGANIZATIONS, &organization.id, None, organization)
            .await
    }

    async fn list_allowed_origins(&self) -> Result<Vec<String>, RegistrationError> {
        let organizations: Vec<Organization> = self.list_docs(ORGANIZATIONS, None).await?;
        let mut origins: Vec<String> = organizations
            .into_iter()
            .flat_map(|org| org.domains)
            .collect();
        origins.sort();
        origins.dedup();
        Ok(origins)
    }

    async fn get_conference(&self, id: &str) -> Result<Option<Conference>, RegistrationError> {
        self.get_doc(CONFERENCES, id).await
    }

    async fn put_conference(&self, conference: &Conference) -> Result<(), RegistrationError> {
        self.put_doc(CONFERENCES, &conference.id, Some(&conference.org_id), conference)
            .await
    }

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, RegistrationError> {
        self.get_doc(REGISTRATIONS, id).await
    }

    async fn put_registration(&self, registration: &Registration) -> Result<(), RegistrationError> {
        self.put_doc(
            REGISTRATIONS,
            &registration.id,
            Some(&registration.user_id),
            registration,
        )
        .await
    }

    async fn find_registrations(
        &self,
        user_id: &str,
        conference_id: &str,
    ) -> Result<Vec<Registration>, RegistrationError> {
        let mut found: Vec<Registration> = self
            .list_docs::<Registration>(REGISTRATIONS, Some(user_id))
            .await?
            .into_iter()
            .filter(|r| r.conference_id == conference_id)
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), RegistrationError> {
        self.put_doc(
            CREDENTIALS,
            &credential_doc_id(&credential.org_id, &credential.id),
            Some(&credential.org_id),
            credential,
        )
        .await
    }

    async fn get_credential(
        &self,
        org_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        self.get_doc(CREDENTIALS, &credential_doc_id(org_id, credential_id))
            .await
    }

    async fn find_credential(
        &self,
        org_id: &str,
        field: CredentialKeyField,
        name: &str,
        code: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        let row = sqlx::query(
            r#"
            SELECT body FROM confreg_documents
            WHERE collection = $1 AND owner = $2
              AND body->>'name' = $3 AND body->>$4 = $5
            LIMIT 1
            "#,
        )
        .bind(CREDENTIALS)
        .bind(org_id)
        .bind(name)
        .bind(field.field_name())
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres credential lookup failed: {e}")))?;

        row.map(|row| decode_body(CREDENTIALS, &row)).transpose()
    }

    async fn claim_credential(
        &self,
        org_id: &str,
        credential_id: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RegistrationError> {
        let doc_id = credential_doc_id(org_id, credential_id);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RegistrationError::Store(format!("postgres begin failed: {e}")))?;

        let row = sqlx::query(
            "SELECT body FROM confreg_documents WHERE collection = $1 AND doc_id = $2 FOR UPDATE",
        )
        .bind(CREDENTIALS)
        .bind(&doc_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres claim read failed: {e}")))?;

        let Some(row) = row else {
            return Ok(ClaimOutcome::NotFound);
        };
        let current: Credential = decode_body(CREDENTIALS, &row)?;
        let (outcome, update) = decide_claim(&current, claimant, now);

        if let Some(updated) = update {
            sqlx::query(
                "UPDATE confreg_documents SET body = $3, updated_at = now() WHERE collection = $1 AND doc_id = $2",
            )
            .bind(CREDENTIALS)
            .bind(&doc_id)
            .bind(serde_json::to_value(&updated)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| RegistrationError::Store(format!("postgres claim write failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| RegistrationError::Store(format!("postgres claim commit failed: {e}")))?;
        Ok(outcome)
    }

    async fn save_draft(&self, draft: &WizardDraft) -> Result<(), RegistrationError> {
        self.put_doc(DRAFTS, &draft.draft_key, Some(&draft.user_id), draft)
            .await
    }

    async fn load_draft(&self, key: &str) -> Result<Option<WizardDraft>, RegistrationError> {
        self.get_doc(DRAFTS, key).await
    }

    async fn put_guest_record(&self, record: &GuestLookupRecord) -> Result<(), RegistrationError> {
        self.put_doc(
            GUESTS,
            &guest_doc_id(&record.email, &record.conference_id),
            None,
            record,
        )
        .await
    }

    async fn get_guest_record(
        &self,
        email: &str,
        conference_id: &str,
    ) -> Result<Option<GuestLookupRecord>, RegistrationError> {
        self.get_doc(GUESTS, &guest_doc_id(email, conference_id))
            .await
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<(), RegistrationError> {
        self.put_doc(PROFILES, &profile.id, None, profile).await
    }

    async fn get_profile(&self, id: &str) -> Result<Option<UserProfile>, RegistrationError> {
        self.get_doc(PROFILES, id).await
    }

    async fn append_history(
        &self,
        user_id: &str,
        entry: &ParticipationHistoryEntry,
    ) -> Result<bool, RegistrationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO confreg_documents (collection, doc_id, owner, body, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (collection, doc_id) DO NOTHING
            "#,
        )
        .bind(HISTORY)
        .bind(format!("{user_id}/{}", entry.registration_id))
        .bind(user_id)
        .bind(serde_json::to_value(entry)?)
        .execute(&self.pool)
        .await
        .map_err(|e| RegistrationError::Store(format!("postgres history append failed: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ParticipationHistoryEntry>, RegistrationError> {
        self.list_docs(HISTORY, Some(user_id)).await
    }

    async fn put_phone_code(&self, record: &PhoneCodeRecord) -> Result<(), RegistrationError> {
        self.put_doc(PHONE_CODES, &record.phone, None, record).await
    }

    async fn get_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneCodeRecord>, RegistrationError> {
        self.get_doc(PHONE_CODES, phone).await
    }

    async fn delete_phone_code(&self, phone: &str) -> Result<(), RegistrationError> {
        self.delete_doc(PHONE_CODES, phone).await
    }
}
