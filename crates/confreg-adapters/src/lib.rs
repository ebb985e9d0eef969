//! Gateway, identity and notification adapters for confreg.

#![deny(unsafe_code)]

use async_trait::async_trait;
use confreg_core::clock::Clock;
use confreg_core::error::RegistrationError;
use confreg_core::gateway::{
    edi_date, is_signature_success, sign_approval, sign_initiation, ApprovalRequest,
    GatewayAdapter, InitiationContext, PaymentInitiation, PaymentResult, SIGNATURE_PROVIDER,
    WIDGET_PROVIDER,
};
use confreg_core::identity::{normalize_email, Identity, IdentityError, IdentityProvider};
use confreg_core::notify::NotificationSender;
use confreg_core::types::Registration;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Merchant settings for the signature-based gateway. The secret never leaves the server.
#[derive(Debug, Clone)]
pub struct SignatureGatewayConfig {
    pub merchant_id: String,
    pub merchant_secret: String,
    /// Endpoint that captures an authenticated transaction.
    pub approval_url: String,
    /// Form action the client posts the inline payment form to.
    pub checkout_action: String,
    pub return_url: String,
    pub timeout_secs: u64,
}

impl Default for SignatureGatewayConfig {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            merchant_secret: String::new(),
            approval_url: "https://webapi.pg.example/webapi/pay_process.jsp".to_string(),
            checkout_action: "https://web.pg.example/v3/v3Payment.jsp".to_string(),
            return_url: "http://localhost:8080/payment/return".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignatureApprovalResponse {
    #[serde(rename = "ResultCode", default)]
    result_code: String,
    #[serde(rename = "ResultMsg", default)]
    result_msg: String,
    #[serde(rename = "TID", default)]
    tid: Option<String>,
}

/// Signature gateway: client-side authentication, server-side approval over a signed form post.
pub struct SignatureGateway {
    config: SignatureGatewayConfig,
    client: Client,
    clock: Arc<dyn Clock>,
}

impl SignatureGateway {
    pub fn new(config: SignatureGatewayConfig, clock: Arc<dyn Clock>) -> Result<Self, RegistrationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RegistrationError::Gateway {
                gateway: SIGNATURE_PROVIDER.to_string(),
                message: format!("http client construction failed: {e}"),
            })?;
        Ok(Self {
            config,
            client,
            clock,
        })
    }

    pub fn merchant_id(&self) -> &str {
        &self.config.merchant_id
    }

    /// Fields the client needs to open the payment window; the signature covers date, merchant and amount.
    pub fn signed_fields(&self, amount: u64) -> (String, String) {
        let edi_date = edi_date(self.clock.now());
        let sign_data = sign_initiation(
            &edi_date,
            &self.config.merchant_id,
            amount,
            &self.config.merchant_secret,
        );
        (edi_date, sign_data)
    }
}

#[async_trait]
impl GatewayAdapter for SignatureGateway {
    fn provider(&self) -> &'static str {
        SIGNATURE_PROVIDER
    }

    async fn initiate(
        &self,
        registration: &Registration,
        context: &InitiationContext,
    ) -> Result<PaymentInitiation, RegistrationError> {
        let (edi_date, sign_data) = self.signed_fields(registration.amount);
        let fields = BTreeMap::from([
            ("GoodsName".to_string(), context.goods_name.clone()),
            ("Amt".to_string(), registration.amount.to_string()),
            ("MID".to_string(), self.config.merchant_id.clone()),
            ("Moid".to_string(), registration.order_id.clone()),
            ("BuyerName".to_string(), context.buyer_name.clone()),
            ("BuyerEmail".to_string(), context.buyer_email.clone()),
            ("ReturnURL".to_string(), self.config.return_url.clone()),
            ("EdiDate".to_string(), edi_date),
            ("SignData".to_string(), sign_data),
            ("CharSet".to_string(), "utf-8".to_string()),
        ]);
        Ok(PaymentInitiation::InlineForm {
            action: self.config.checkout_action.clone(),
            fields,
        })
    }

    async fn approve(&self, request: &ApprovalRequest) -> PaymentResult {
        let tid = request.transaction_ref.trim();
        if tid.is_empty() {
            return PaymentResult::declined("MISSING_TID", "transaction id is required");
        }

        let amount = request.amount.to_string();
        let edi_date = edi_date(self.clock.now());
        let sign_data = sign_approval(
            tid,
            &self.config.merchant_id,
            request.amount,
            &self.config.merchant_secret,
        );
        let form = [
            ("TID", tid),
            ("MID", self.config.merchant_id.as_str()),
            ("EdiDate", edi_date.as_str()),
            ("Amt", amount.as_str()),
            ("SignData", sign_data.as_str()),
            ("CharSet", "utf-8"),
            ("EdiType", "JSON"),
        ];

        let response = match self
            .client
            .post(&self.config.approval_url)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return PaymentResult::Error {
                    message: format!("approval request failed: {e}"),
                }
            }
        };
        if !response.status().is_success() {
            return PaymentResult::Error {
                message: format!("approval endpoint returned {}", response.status()),
            };
        }
        let raw: Value = match response.json().await {
            Ok(raw) => raw,
            Err(e) => {
                return PaymentResult::Error {
                    message: format!("approval response unreadable: {e}"),
                }
            }
        };
        let parsed: SignatureApprovalResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return PaymentResult::Error {
                    message: format!("approval response malformed: {e}"),
                }
            }
        };

        if is_signature_success(&parsed.result_code) {
            debug!(order_id = %request.registration.order_id, code = %parsed.result_code, "signature approval succeeded");
            PaymentResult::Approved {
                transaction_ref: parsed.tid.unwrap_or_else(|| tid.to_string()),
                amount: request.amount,
                raw,
            }
        } else {
            PaymentResult::declined(parsed.result_code, parsed.result_msg)
        }
    }
}

#[derive(Debug, Clone)]
pub struct WidgetGatewayConfig {
    /// Public key embedded in the checkout widget.
    pub client_key: String,
    pub checkout_url: String,
    /// Base of the conference site the widget redirects back to.
    pub public_base_url: String,
}

impl Default for WidgetGatewayConfig {
    fn default() -> Self {
        Self {
            client_key: String::new(),
            checkout_url: "https://widget.pg.example/checkout".to_string(),
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetRedirectPayload {
    #[serde(default)]
    payment_key: String,
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    amount: Option<u64>,
}

/// Widget gateway: the client completes checkout and the redirect carries the approval.
pub struct WidgetGateway {
    config: WidgetGatewayConfig,
}

impl WidgetGateway {
    pub fn new(config: WidgetGatewayConfig) -> Self {
        Self { config }
    }

    /// Account id for members, a throwaway key for guests.
    pub fn customer_key(registration: &Registration) -> String {
        if registration.is_guest() {
            format!("guest-{}", Uuid::new_v4())
        } else {
            registration.user_id.clone()
        }
    }

    pub fn return_urls(
        &self,
        registration: &Registration,
        slug: &str,
    ) -> Result<(String, String), RegistrationError> {
        let base = self.config.public_base_url.trim_end_matches('/');
        let params = [
            ("slug", slug),
            ("orgId", registration.org_id.as_str()),
            ("conferenceId", registration.conference_id.as_str()),
            ("registrationId", registration.id.as_str()),
        ];
        let success = Url::parse_with_params(&format!("{base}/{slug}/payment/success"), &params)
            .map_err(|e| RegistrationError::invalid(format!("invalid public base url: {e}")))?;
        let fail = Url::parse_with_params(&format!("{base}/{slug}/payment/fail"), &params)
            .map_err(|e| RegistrationError::invalid(format!("invalid public base url: {e}")))?;
        Ok((success.into(), fail.into()))
    }
}

#[async_trait]
impl GatewayAdapter for WidgetGateway {
    fn provider(&self) -> &'static str {
        WIDGET_PROVIDER
    }

    async fn initiate(
        &self,
        registration: &Registration,
        context: &InitiationContext,
    ) -> Result<PaymentInitiation, RegistrationError> {
        let (success_url, fail_url) = self.return_urls(registration, &context.slug)?;
        let amount = registration.amount.to_string();
        let customer_key = Self::customer_key(registration);
        let url = Url::parse_with_params(
            &self.config.checkout_url,
            &[
                ("clientKey", self.config.client_key.as_str()),
                ("customerKey", customer_key.as_str()),
                ("amount", amount.as_str()),
                ("orderId", registration.order_id.as_str()),
                ("orderName", context.goods_name.as_str()),
                ("customerEmail", context.buyer_email.as_str()),
                ("successUrl", success_url.as_str()),
                ("failUrl", fail_url.as_str()),
            ],
        )
        .map_err(|e| RegistrationError::invalid(format!("invalid checkout url: {e}")))?;
        Ok(PaymentInitiation::Redirect { url: url.into() })
    }

    async fn approve(&self, request: &ApprovalRequest) -> PaymentResult {
        let payload: WidgetRedirectPayload = match serde_json::from_value(request.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return PaymentResult::declined("INVALID_PAYLOAD", format!("redirect payload malformed: {e}"))
            }
        };
        let payment_key = if payload.payment_key.is_empty() {
            request.transaction_ref.clone()
        } else {
            payload.payment_key
        };
        if payment_key.is_empty() {
            return PaymentResult::declined("INVALID_PAYLOAD", "paymentKey is required");
        }
        if payload.order_id != request.registration.order_id {
            warn!(
                registration_id = %request.registration.id,
                order_id = %payload.order_id,
                "widget redirect order id mismatch"
            );
            return PaymentResult::declined("ORDER_MISMATCH", "order id does not match the registration");
        }
        let amount = payload.amount.unwrap_or(request.amount);
        if amount != request.registration.amount {
            return PaymentResult::declined("AMOUNT_MISMATCH", "amount does not match the registration");
        }

        PaymentResult::Approved {
            transaction_ref: payment_key,
            amount,
            raw: request.payload.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Account {
    id: String,
    password: String,
}

#[derive(Default)]
struct IdentityTables {
    accounts: HashMap<String, Account>,
    anonymous: HashSet<String>,
    tokens: HashMap<String, Identity>,
}

/// Process-local identity provider for development and tests.
#[derive(Default)]
pub struct InMemoryIdentityProvider {
    tables: RwLock<IdentityTables>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_account(&self, email: &str, password: &str) -> Result<Identity, IdentityError> {
        let email = normalize_email(email);
        let mut tables = self.tables.write().await;
        if tables.accounts.contains_key(&email) {
            return Err(IdentityError::EmailAlreadyInUse);
        }
        let id = Uuid::new_v4().to_string();
        tables.accounts.insert(
            email.clone(),
            Account {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        Ok(Identity::account(id, email))
    }

    /// Bearer token that `resolve_token` maps back to `identity`.
    pub async fn issue_token(&self, identity: &Identity) -> String {
        let token = format!("token-{}", Uuid::new_v4().simple());
        self.tables
            .write()
            .await
            .tokens
            .insert(token.clone(), identity.clone());
        token
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn sign_in_anonymously(&self) -> Result<Identity, IdentityError> {
        let identity = Identity::anonymous(format!("anon-{}", Uuid::new_v4().simple()));
        self.tables
            .write()
            .await
            .anonymous
            .insert(identity.id.clone());
        Ok(identity)
    }

    async fn link_anonymous(
        &self,
        anonymous_id: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, IdentityError> {
        if password.chars().count() < 6 {
            return Err(IdentityError::WeakPassword);
        }
        let email = normalize_email(email);
        let mut tables = self.tables.write().await;
        if tables.accounts.contains_key(&email) {
            return Err(IdentityError::EmailAlreadyInUse);
        }
        if !tables.anonymous.remove(anonymous_id) {
            return Err(IdentityError::NotAnonymous(anonymous_id.to_string()));
        }
        tables.accounts.insert(
            email.clone(),
            Account {
                id: anonymous_id.to_string(),
                password: password.to_string(),
            },
        );
        info!(identity = anonymous_id, "anonymous identity upgraded to account");
        Ok(Identity::account(anonymous_id, email))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, IdentityError> {
        let email = normalize_email(email);
        let tables = self.tables.read().await;
        match tables.accounts.get(&email) {
            Some(account) if account.password == password => {
                Ok(Identity::account(account.id.clone(), email))
            }
            _ => Err(IdentityError::InvalidCredential),
        }
    }

    async fn email_exists(&self, email: &str) -> Result<bool, IdentityError> {
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .contains_key(&normalize_email(email)))
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.tables.read().await.tokens.get(token).cloned())
    }
}

/// Notification sender that only logs; codes appear at debug level.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send_code(&self, phone: &str, code: &str) -> Result<(), RegistrationError> {
        info!(phone_len = phone.len(), "verification code dispatched");
        debug!(phone = phone, code_len = code.len(), "verification code queued");
        Ok(())
    }
}
