//! Conference registration core.
//!
//! Member credential verification with one-time claims, a guest-friendly identity bridge,
//! the step-gated registration wizard and server-side payment reconciliation.

#![deny(unsafe_code)]

pub mod cache;
pub mod clock;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod notify;
pub mod reconciler;
pub mod storage;
pub mod types;
pub mod wizard;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{OriginAllowList, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{match_grade, CredentialVerifier, VerifyOutcome, VerifyRequest};
pub use error::RegistrationError;
pub use gateway::{
    edi_date, is_signature_success, sign_approval, sign_initiation, ApprovalRequest,
    GatewayAdapter, GatewayRegistry, InitiationContext, PaymentInitiation, PaymentResult,
    SIGNATURE_PROVIDER, WIDGET_PROVIDER,
};
pub use identity::{
    hash_guest_password, Identity, IdentityBridge, IdentityError, IdentityProvider,
    IdentitySession, IdentityState, LinkOutcome,
};
pub use notify::{NotificationSender, PhoneVerifier};
pub use reconciler::{non_fatal, ConfirmationOutcome, ConfirmationRequest, PaymentReconciler};
pub use storage::{
    bootstrap_store, ClaimOutcome, ClaimReason, DocumentStore, MemoryDocumentStore,
    PostgresDocumentStore, StoreConfig,
};
pub use types::{
    Conference, Credential, Grade, Organization, PaymentStatus, PersonalInfo, Registration,
    RegistrationPeriod, RegistrationStatus, GUEST_USER_ID,
};
pub use wizard::{
    GradeSelection, InfoOutcome, PaymentReady, PendingRestore, RegistrationWizard, WizardStep,
};
