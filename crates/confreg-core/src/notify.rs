use crate::clock::Clock;
use crate::error::RegistrationError;
use crate::storage::DocumentStore;
use crate::types::PhoneCodeRecord;
use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

pub const PHONE_CODE_TTL_SECS: i64 = 180;
pub const MAX_PHONE_CODE_ATTEMPTS: u32 = 5;

/// Outbound text-message channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_code(&self, phone: &str, code: &str) -> Result<(), RegistrationError>;
}

/// Digits only, so `010-1234-5678` and `01012345678` share one record.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

fn hash_code(phone: &str, code: &str) -> String {
    hex::encode(Sha256::digest(format!("{phone}:{code}").as_bytes()))
}

/// Issues and checks one-time phone codes. Only the hash of a code is stored.
pub struct PhoneVerifier {
    store: Arc<dyn DocumentStore>,
    sender: Arc<dyn NotificationSender>,
    clock: Arc<dyn Clock>,
}

impl PhoneVerifier {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sender,
            clock,
        }
    }

    /// Issue a fresh 6-digit code, replacing any outstanding one.
    pub async fn send_code(&self, phone: &str) -> Result<(), RegistrationError> {
        let phone = normalize_phone(phone);
        if phone.len() < 9 {
            return Err(RegistrationError::invalid("a valid phone number is required"));
        }

        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let record = PhoneCodeRecord {
            phone: phone.clone(),
            code_hash: hash_code(&phone, &code),
            expires_at: self.clock.now() + Duration::seconds(PHONE_CODE_TTL_SECS),
            attempts: 0,
        };
        self.store.put_phone_code(&record).await?;
        self.sender.send_code(&phone, &code).await?;
        info!(phone_suffix = %&phone[phone.len() - 4..], "phone code issued");
        Ok(())
    }

    /// Check and consume a code. Wrong, expired or exhausted codes yield `false`.
    pub async fn verify_code(&self, phone: &str, code: &str) -> Result<bool, RegistrationError> {
        let phone = normalize_phone(phone);
        let Some(mut record) = self.store.get_phone_code(&phone).await? else {
            return Ok(false);
        };

        if record.expires_at < self.clock.now() || record.attempts >= MAX_PHONE_CODE_ATTEMPTS {
            self.store.delete_phone_code(&phone).await?;
            debug!("phone code expired or exhausted");
            return Ok(false);
        }

        if record.code_hash != hash_code(&phone, code.trim()) {
            record.attempts += 1;
            self.store.put_phone_code(&record).await?;
            return Ok(false);
        }

        self.store.delete_phone_code(&phone).await?;
        Ok(true)
    }
}
