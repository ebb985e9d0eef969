//! Server-side payment confirmation.
//!
//! Capturing the payment and marking the registration paid is the load-bearing step.
//! Locking the member credential and writing participation history are bookkeeping:
//! they run through [`non_fatal`] and never fail a confirmed payment.

use crate::clock::Clock;
use crate::credential::CredentialVerifier;
use crate::error::RegistrationError;
use crate::gateway::{ApprovalRequest, GatewayRegistry, PaymentResult};
use crate::storage::{ClaimOutcome, ClaimReason, DocumentStore};
use crate::types::{
    ParticipationHistoryEntry, PaymentStatus, Registration, RegistrationStatus, GUEST_USER_ID,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Step index of the completed wizard.
const COMPLETE_STEP: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub provider: String,
    pub registration_id: String,
    pub conference_id: String,
    pub transaction_ref: String,
    pub amount: u64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub registration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub credential_locked: bool,
    pub history_recorded: bool,
}

/// Run a bookkeeping step; failures are logged and reported as `None`.
pub async fn non_fatal<T, F>(step: &'static str, registration_id: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, RegistrationError>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                step = step,
                registration_id = registration_id,
                error = %err,
                "non-fatal confirmation step failed"
            );
            None
        }
    }
}

pub struct PaymentReconciler {
    store: Arc<dyn DocumentStore>,
    gateways: Arc<GatewayRegistry>,
    verifier: Arc<CredentialVerifier>,
    clock: Arc<dyn Clock>,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateways: Arc<GatewayRegistry>,
        verifier: Arc<CredentialVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateways,
            verifier,
            clock,
        }
    }

    /// Finalize a registration after a gateway approval. Safe to call more than once.
    pub async fn confirm(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<ConfirmationOutcome, RegistrationError> {
        let registration = self.load_checked(request).await?;
        let adapter = self.gateways.get(&request.provider)?;

        if self.has_finalized_sibling(&registration).await? {
            warn!(
                registration_id = %registration.id,
                conference_id = %registration.conference_id,
                "confirmation refused, another registration is already paid"
            );
            return Ok(ConfirmationOutcome {
                success: false,
                message: "already registered for this conference".to_string(),
                code: Some("ALREADY_REGISTERED".to_string()),
                registration_id: registration.id,
                order_id: None,
                credential_locked: false,
                history_recorded: false,
            });
        }

        let result = adapter
            .approve(&ApprovalRequest {
                registration: registration.clone(),
                transaction_ref: request.transaction_ref.clone(),
                amount: request.amount,
                payload: request.payload.clone(),
            })
            .await;

        match result {
            PaymentResult::Error { message } => {
                error!(
                    provider = %request.provider,
                    registration_id = %registration.id,
                    error = %message,
                    "payment gateway approval failed"
                );
                Err(RegistrationError::Gateway {
                    gateway: request.provider.clone(),
                    message,
                })
            }
            PaymentResult::Declined { code, message } => {
                info!(
                    provider = %request.provider,
                    registration_id = %registration.id,
                    code = %code,
                    "payment declined"
                );
                Ok(ConfirmationOutcome {
                    success: false,
                    message,
                    code: Some(code),
                    registration_id: registration.id,
                    order_id: None,
                    credential_locked: false,
                    history_recorded: false,
                })
            }
            PaymentResult::Approved {
                transaction_ref,
                amount,
                raw,
            } => {
                let registration = self
                    .mark_paid(registration, &request.provider, &transaction_ref, amount, raw)
                    .await?;

                let credential_locked =
                    non_fatal("credential_lock", &registration.id, self.lock_credential(&registration))
                        .await
                        .unwrap_or(false);
                let history_recorded = if registration.is_guest() {
                    false
                } else {
                    non_fatal("participation_history", &registration.id, self.record_history(&registration))
                        .await
                        .unwrap_or(false)
                };

                info!(
                    registration_id = %registration.id,
                    order_id = %registration.order_id,
                    credential_locked = credential_locked,
                    history_recorded = history_recorded,
                    "payment confirmed"
                );
                Ok(ConfirmationOutcome {
                    success: true,
                    message: "Payment confirmed".to_string(),
                    code: None,
                    registration_id: registration.id,
                    order_id: Some(registration.order_id),
                    credential_locked,
                    history_recorded,
                })
            }
        }
    }

    async fn load_checked(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<Registration, RegistrationError> {
        if request.registration_id.trim().is_empty() || request.conference_id.trim().is_empty() {
            return Err(RegistrationError::invalid(
                "registrationId and conferenceId are required",
            ));
        }
        let registration = self
            .store
            .get_registration(&request.registration_id)
            .await?
            .ok_or_else(|| {
                RegistrationError::NotFound(format!(
                    "registration '{}' not found",
                    request.registration_id
                ))
            })?;

        if registration.conference_id != request.conference_id {
            debug!(registration_id = %registration.id, "conference id mismatch on confirmation");
            return Err(RegistrationError::invalid(
                "registration does not belong to this conference",
            ));
        }
        if registration.amount != request.amount {
            debug!(
                registration_id = %registration.id,
                expected = registration.amount,
                received = request.amount,
                "amount mismatch on confirmation"
            );
            return Err(RegistrationError::InvalidArgument(format!(
                "amount {} does not match registration amount {}",
                request.amount, registration.amount
            )));
        }
        Ok(registration)
    }

    /// Whether another registration of the same user for this conference is already final.
    async fn has_finalized_sibling(
        &self,
        registration: &Registration,
    ) -> Result<bool, RegistrationError> {
        if registration.user_id == GUEST_USER_ID {
            return Ok(false);
        }
        let siblings = self
            .store
            .find_registrations(&registration.user_id, &registration.conference_id)
            .await?;
        Ok(siblings
            .iter()
            .any(|other| other.id != registration.id && other.is_finalized()))
    }

    async fn mark_paid(
        &self,
        mut registration: Registration,
        provider: &str,
        transaction_ref: &str,
        amount: u64,
        raw: Value,
    ) -> Result<Registration, RegistrationError> {
        let now = self.clock.now();
        registration.status = RegistrationStatus::Completed;
        // A repeat confirmation keeps the details of the capture that settled the registration.
        if registration.payment_status == PaymentStatus::Pending
            || registration.payment_details.is_none()
        {
            registration.payment_provider = Some(provider.to_string());
            registration.payment_details = Some(json!({
                "provider": provider,
                "transactionRef": transaction_ref,
                "amount": amount,
                "raw": raw,
            }));
        }
        if registration.payment_status == PaymentStatus::Pending {
            registration.payment_status = PaymentStatus::Paid;
        }
        registration.paid_at = registration.paid_at.or(Some(now));
        registration.current_step = COMPLETE_STEP;
        registration.updated_at = now;

        self.store.put_registration(&registration).await.map_err(|err| {
            error!(
                registration_id = %registration.id,
                error = %err,
                "failed to persist paid registration"
            );
            err
        })?;
        Ok(registration)
    }

    async fn lock_credential(&self, registration: &Registration) -> Result<bool, RegistrationError> {
        let Some(snapshot) = registration.member_verification_data.as_ref() else {
            return Ok(false);
        };
        let org_id = snapshot
            .org_id
            .clone()
            .unwrap_or_else(|| registration.org_id.clone());
        let outcome = self
            .verifier
            .claim(&org_id, &snapshot.id, &registration.user_id, ClaimReason::Payment)
            .await?;
        Ok(matches!(
            outcome,
            ClaimOutcome::Claimed(_) | ClaimOutcome::AlreadyOwned(_)
        ))
    }

    async fn record_history(&self, registration: &Registration) -> Result<bool, RegistrationError> {
        let conference_title = self
            .store
            .get_conference(&registration.conference_id)
            .await?
            .map(|conference| conference.title)
            .unwrap_or_default();
        let entry = ParticipationHistoryEntry {
            registration_id: registration.id.clone(),
            conference_id: registration.conference_id.clone(),
            conference_title,
            tier: registration.tier_name.clone(),
            amount: registration.amount,
            order_id: registration.order_id.clone(),
            paid_at: registration.paid_at.unwrap_or(registration.updated_at),
        };
        let appended = self
            .store
            .append_history(&registration.user_id, &entry)
            .await?;
        if !appended {
            debug!(registration_id = %registration.id, "participation history already recorded");
        }
        Ok(true)
    }
}
