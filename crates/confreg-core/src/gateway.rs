//! Payment gateway boundary: tagged results, adapter trait and provider registry.

use crate::error::RegistrationError;
use crate::types::Registration;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const SIGNATURE_PROVIDER: &str = "signature";
pub const WIDGET_PROVIDER: &str = "widget";

/// Approval result codes the signature gateway reports for a captured payment.
pub const SIGNATURE_SUCCESS_CODES: [&str; 5] = [
    "3001", // card
    "4000", // bank transfer
    "4100", // virtual account
    "A000", // mobile
    "7001", // point
];

/// Gateway timestamps are wall-clock time in the merchant's timezone (UTC+9).
const MERCHANT_UTC_OFFSET_SECS: i32 = 9 * 3600;

/// Outcome of asking a gateway to capture a payment.
///
/// `Declined` is a business rejection; `Error` means the gateway could not answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentResult {
    Approved {
        transaction_ref: String,
        amount: u64,
        raw: Value,
    },
    Declined {
        code: String,
        message: String,
    },
    Error {
        message: String,
    },
}

impl PaymentResult {
    pub fn declined(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Declined {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// How the client should start a payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentInitiation {
    Redirect {
        url: String,
    },
    InlineForm {
        action: String,
        fields: BTreeMap<String, String>,
    },
}

/// Caller-side context for building an initiation.
#[derive(Debug, Clone)]
pub struct InitiationContext {
    pub slug: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub goods_name: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub registration: Registration,
    pub transaction_ref: String,
    pub amount: u64,
    pub payload: Value,
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn initiate(
        &self,
        registration: &Registration,
        context: &InitiationContext,
    ) -> Result<PaymentInitiation, RegistrationError>;

    /// Capture the payment. Transport failures are reported as `PaymentResult::Error`.
    async fn approve(&self, request: &ApprovalRequest) -> PaymentResult;
}

/// Configured gateway adapters keyed by provider id.
#[derive(Default)]
pub struct GatewayRegistry {
    adapters: HashMap<String, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn GatewayAdapter>) {
        self.adapters
            .insert(adapter.provider().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn GatewayAdapter>, RegistrationError> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| RegistrationError::GatewayNotFound(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.adapters.keys().cloned().collect();
        providers.sort();
        providers
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `yyyyMMddHHmmss` in merchant time.
pub fn edi_date(now: DateTime<Utc>) -> String {
    const FORMAT: &str = "%Y%m%d%H%M%S";
    match FixedOffset::east_opt(MERCHANT_UTC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset).format(FORMAT).to_string(),
        None => now.format(FORMAT).to_string(),
    }
}

pub fn sign_initiation(edi_date: &str, merchant_id: &str, amount: u64, secret: &str) -> String {
    sha256_hex(&format!("{edi_date}{merchant_id}{amount}{secret}"))
}

pub fn sign_approval(tid: &str, merchant_id: &str, amount: u64, secret: &str) -> String {
    sha256_hex(&format!("{tid}{merchant_id}{amount}{secret}"))
}

pub fn is_signature_success(result_code: &str) -> bool {
    SIGNATURE_SUCCESS_CODES.contains(&result_code.trim())
}
