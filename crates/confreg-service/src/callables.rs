//! RPC-style callables exposed under `/v1/callable/:name`.

use crate::{ApiError, ServiceState};
use confreg_core::{
    ConfirmationOutcome, ConfirmationRequest, Identity, InitiationContext, Registration,
    RegistrationError, RegistrationStatus, VerifyOutcome, VerifyRequest, SIGNATURE_PROVIDER,
    WIDGET_PROVIDER,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

pub const CONFIRM_SIGNATURE: &str = "confirmPaymentA";
pub const CONFIRM_WIDGET: &str = "confirmPaymentB";
pub const VERIFY_CREDENTIAL: &str = "verifyCredential";
pub const CHECK_EMAIL_EXISTS: &str = "checkEmailExists";
pub const RESUME_GUEST_REGISTRATION: &str = "resumeGuestRegistration";
pub const REQUEST_PAYMENT_SIGNATURE: &str = "requestPaymentSignature";
pub const INITIATE_PAYMENT: &str = "initiatePayment";
pub const SEND_PHONE_CODE: &str = "sendPhoneCode";
pub const VERIFY_PHONE_CODE: &str = "verifyPhoneCode";

pub async fn dispatch(
    state: &ServiceState,
    name: &str,
    caller: Option<&Identity>,
    data: Value,
) -> Result<Value, ApiError> {
    match name {
        CONFIRM_SIGNATURE => respond(confirm_signature(state, data).await?),
        CONFIRM_WIDGET => respond(confirm_widget(state, data).await?),
        VERIFY_CREDENTIAL => respond(verify_credential(state, caller, parse(data)?).await?),
        CHECK_EMAIL_EXISTS => {
            let EmailData { email } = parse(data)?;
            let exists = state.bridge.check_email_exists(&email).await?;
            Ok(json!({ "exists": exists }))
        }
        RESUME_GUEST_REGISTRATION => {
            let data: ResumeData = parse(data)?;
            let registration = state
                .bridge
                .resume_guest_registration(&data.email, &data.password, &data.conference_id)
                .await?;
            Ok(json!({ "registration": registration }))
        }
        REQUEST_PAYMENT_SIGNATURE => respond(payment_signature(state, parse(data)?).await?),
        INITIATE_PAYMENT => initiate_payment(state, parse(data)?).await,
        SEND_PHONE_CODE => {
            let PhoneData { phone } = parse(data)?;
            state.phone.send_code(&phone).await?;
            Ok(json!({ "sent": true }))
        }
        VERIFY_PHONE_CODE => {
            let data: PhoneCodeData = parse(data)?;
            let verified = state.phone.verify_code(&data.phone, &data.code).await?;
            Ok(json!({ "verified": verified }))
        }
        _ => Err(ApiError::not_found(format!("callable '{name}' does not exist"))),
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data).map_err(|e| ApiError::bad_request(format!("invalid data: {e}")))
}

fn respond<T: Serialize>(value: T) -> Result<Value, ApiError> {
    Ok(serde_json::to_value(value).map_err(RegistrationError::from)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureConfirmData {
    registration_id: String,
    conference_id: String,
    tid: String,
    amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetConfirmData {
    payment_key: String,
    registration_id: String,
    conference_id: String,
    amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyCredentialData {
    #[serde(flatten)]
    request: VerifyRequest,
    /// Grades of this conference are used for auto-selection.
    conference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmailData {
    email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeData {
    email: String,
    password: String,
    conference_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRef {
    registration_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateData {
    provider: String,
    registration_id: String,
    buyer_name: Option<String>,
    buyer_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhoneData {
    phone: String,
}

#[derive(Debug, Deserialize)]
struct PhoneCodeData {
    phone: String,
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentSignature {
    edi_date: String,
    sign_data: String,
    merchant_id: String,
    amount: u64,
    order_id: String,
}

async fn confirm_signature(
    state: &ServiceState,
    data: Value,
) -> Result<ConfirmationOutcome, ApiError> {
    let parsed: SignatureConfirmData = parse(data.clone())?;
    let request = ConfirmationRequest {
        provider: SIGNATURE_PROVIDER.to_string(),
        registration_id: parsed.registration_id,
        conference_id: parsed.conference_id,
        transaction_ref: parsed.tid,
        amount: parsed.amount,
        payload: data,
    };
    Ok(state.reconciler.confirm(&request).await?)
}

async fn confirm_widget(
    state: &ServiceState,
    data: Value,
) -> Result<ConfirmationOutcome, ApiError> {
    let parsed: WidgetConfirmData = parse(data.clone())?;
    let request = ConfirmationRequest {
        provider: WIDGET_PROVIDER.to_string(),
        registration_id: parsed.registration_id,
        conference_id: parsed.conference_id,
        transaction_ref: parsed.payment_key,
        amount: parsed.amount,
        payload: data,
    };
    Ok(state.reconciler.confirm(&request).await?)
}

async fn verify_credential(
    state: &ServiceState,
    caller: Option<&Identity>,
    data: VerifyCredentialData,
) -> Result<VerifyOutcome, ApiError> {
    let grades = match data.conference_id.as_deref() {
        Some(conference_id) => {
            state
                .store
                .get_conference(conference_id)
                .await?
                .ok_or_else(|| {
                    RegistrationError::NotFound(format!("conference {conference_id}"))
                })?
                .grades
        }
        None => Vec::new(),
    };
    let caller_id = caller.map(|identity| identity.id.as_str());
    Ok(state
        .verifier
        .verify(&data.request, &grades, caller_id)
        .await?)
}

async fn pending_registration(
    state: &ServiceState,
    registration_id: &str,
) -> Result<Registration, ApiError> {
    if registration_id.trim().is_empty() {
        return Err(RegistrationError::invalid("registrationId is required").into());
    }
    let registration = state
        .store
        .get_registration(registration_id)
        .await?
        .ok_or_else(|| RegistrationError::NotFound(format!("registration {registration_id}")))?;
    if registration.status != RegistrationStatus::Pending {
        return Err(RegistrationError::InvariantViolation(format!(
            "registration {registration_id} is already finalized"
        ))
        .into());
    }
    Ok(registration)
}

async fn payment_signature(
    state: &ServiceState,
    data: RegistrationRef,
) -> Result<PaymentSignature, ApiError> {
    let registration = pending_registration(state, &data.registration_id).await?;
    let (edi_date, sign_data) = state.signature.signed_fields(registration.amount);
    Ok(PaymentSignature {
        edi_date,
        sign_data,
        merchant_id: state.signature.merchant_id().to_string(),
        amount: registration.amount,
        order_id: registration.order_id,
    })
}

async fn initiate_payment(state: &ServiceState, data: InitiateData) -> Result<Value, ApiError> {
    let mut registration = pending_registration(state, &data.registration_id).await?;
    let gateway = state.gateways.get(&data.provider)?;
    let conference = state
        .store
        .get_conference(&registration.conference_id)
        .await?
        .ok_or_else(|| {
            RegistrationError::NotFound(format!("conference {}", registration.conference_id))
        })?;

    let info = registration.form_data.info.clone().unwrap_or_default();
    let now = state.clock.now();
    let context = InitiationContext {
        slug: conference.slug.clone(),
        buyer_name: data.buyer_name.unwrap_or(info.name),
        buyer_email: data.buyer_email.unwrap_or(info.email),
        goods_name: conference.title.clone(),
        now,
    };
    let initiation = gateway.initiate(&registration, &context).await?;

    registration.payment_provider = Some(gateway.provider().to_string());
    registration.updated_at = now;
    state.store.put_registration(&registration).await?;
    info!(
        registration_id = %registration.id,
        provider = gateway.provider(),
        "payment initiated"
    );

    respond(initiation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceConfig, ServiceState};
    use chrono::{TimeZone, Utc};
    use confreg_adapters::{InMemoryIdentityProvider, LoggingNotificationSender};
    use confreg_core::{
        Conference, DocumentStore, Grade, ManualClock, MemoryDocumentStore, NotificationSender,
        RegistrationPeriod,
    };
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CapturingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl NotificationSender for CapturingSender {
        async fn send_code(&self, phone: &str, code: &str) -> Result<(), RegistrationError> {
            self.sent
                .lock()
                .unwrap()
                .push((phone.to_string(), code.to_string()));
            Ok(())
        }
    }

    fn conference(now: chrono::DateTime<Utc>) -> Conference {
        Conference {
            id: "conf-1".to_string(),
            org_id: "org1".to_string(),
            slug: "spring".to_string(),
            title: "Spring Meeting".to_string(),
            order_prefix: "KSA".to_string(),
            periods: vec![RegistrationPeriod {
                id: "regular".to_string(),
                name: "Regular".to_string(),
                starts_at: now - chrono::Duration::days(1),
                ends_at: now + chrono::Duration::days(1),
                prices: BTreeMap::from([("member".to_string(), 70_000)]),
            }],
            grades: vec![Grade::new("member", "MEMBER", "Member")],
            consent_clauses: vec![],
        }
    }

    fn state_with(
        store: Arc<MemoryDocumentStore>,
        sender: Arc<dyn NotificationSender>,
    ) -> ServiceState {
        let now = Utc.with_ymd_and_hms(2026, 5, 2, 3, 0, 0).unwrap();
        ServiceState::assemble(
            ServiceConfig::default(),
            store,
            Arc::new(InMemoryIdentityProvider::new()),
            sender,
            Arc::new(ManualClock::new(now)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn phone_code_round_trip_through_callables() {
        let sender = Arc::new(CapturingSender::default());
        let state = state_with(Arc::new(MemoryDocumentStore::new()), sender.clone());

        let sent = dispatch(
            &state,
            SEND_PHONE_CODE,
            None,
            json!({"phone": "010-1234-5678"}),
        )
        .await
        .unwrap();
        assert_eq!(sent["sent"], true);

        let code = sender.sent.lock().unwrap()[0].1.clone();
        let wrong = dispatch(
            &state,
            VERIFY_PHONE_CODE,
            None,
            json!({"phone": "01012345678", "code": "000000x"}),
        )
        .await
        .unwrap();
        assert_eq!(wrong["verified"], false);

        let right = dispatch(
            &state,
            VERIFY_PHONE_CODE,
            None,
            json!({"phone": "01012345678", "code": code}),
        )
        .await
        .unwrap();
        assert_eq!(right["verified"], true);
    }

    #[tokio::test]
    async fn widget_initiation_records_provider() {
        let store = Arc::new(MemoryDocumentStore::new());
        let state = state_with(store.clone(), Arc::new(LoggingNotificationSender));
        let conference = conference(state.clock.now());
        store.put_conference(&conference).await.unwrap();
        let registration = Registration::new_pending(
            &conference,
            "user-1",
            &conference.grades[0],
            70_000,
            state.clock.now(),
        );
        store.put_registration(&registration).await.unwrap();

        let initiation = dispatch(
            &state,
            INITIATE_PAYMENT,
            None,
            json!({
                "provider": "widget",
                "registrationId": registration.id,
                "buyerName": "Kim",
                "buyerEmail": "kim@example.org"
            }),
        )
        .await
        .unwrap();
        assert_eq!(initiation["kind"], "redirect");
        let url = initiation["url"].as_str().unwrap();
        assert!(url.contains(&registration.order_id));
        assert!(url.contains("amount=70000"));

        let stored = store
            .get_registration(&registration.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payment_provider.as_deref(), Some("widget"));
    }

    #[tokio::test]
    async fn unknown_provider_is_internal_and_finalized_registration_is_refused() {
        let store = Arc::new(MemoryDocumentStore::new());
        let state = state_with(store.clone(), Arc::new(LoggingNotificationSender));
        let conference = conference(state.clock.now());
        store.put_conference(&conference).await.unwrap();
        let mut registration = Registration::new_pending(
            &conference,
            "user-1",
            &conference.grades[0],
            70_000,
            state.clock.now(),
        );
        store.put_registration(&registration).await.unwrap();

        let err = dispatch(
            &state,
            INITIATE_PAYMENT,
            None,
            json!({"provider": "bank-transfer", "registrationId": registration.id}),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Core(RegistrationError::GatewayNotFound(_))
        ));

        registration.status = RegistrationStatus::Completed;
        store.put_registration(&registration).await.unwrap();
        let err = dispatch(
            &state,
            REQUEST_PAYMENT_SIGNATURE,
            None,
            json!({"registrationId": registration.id}),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Core(RegistrationError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn malformed_data_is_invalid_argument() {
        let state = state_with(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(LoggingNotificationSender),
        );
        let err = dispatch(&state, CONFIRM_SIGNATURE, None, json!({"tid": 12}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Callable { code: "invalid-argument", .. }));
    }
}
