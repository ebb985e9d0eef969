//! Multi-step registration wizard.
//!
//! Steps run Terms -> Info -> Category -> Payment -> Complete and cannot be skipped.
//! Every forward transition autosaves a draft so the attendee can resume later.

use crate::clock::Clock;
use crate::credential::VerifyOutcome;
use crate::error::RegistrationError;
use crate::identity::{IdentityBridge, IdentitySession, LinkOutcome};
use crate::reconciler::ConfirmationOutcome;
use crate::storage::DocumentStore;
use crate::types::{
    generate_order_id, Agreements, Conference, FormData, Grade, MemberVerificationSnapshot, PersonalInfo,
    Registration, RegistrationStatus, WizardDraft,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WizardStep {
    Terms,
    Info,
    Category,
    Payment,
    Complete,
}

impl WizardStep {
    pub fn name(self) -> &'static str {
        match self {
            Self::Terms => "terms",
            Self::Info => "info",
            Self::Category => "category",
            Self::Payment => "payment",
            Self::Complete => "complete",
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Terms => 0,
            Self::Info => 1,
            Self::Category => 2,
            Self::Payment => 3,
            Self::Complete => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Terms),
            1 => Some(Self::Info),
            2 => Some(Self::Category),
            3 => Some(Self::Payment),
            4 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Enforces terms->info->category->payment->complete ordering.
#[derive(Debug, Clone)]
pub struct WizardStepMachine {
    step: WizardStep,
}

impl Default for WizardStepMachine {
    fn default() -> Self {
        Self {
            step: WizardStep::Terms,
        }
    }
}

impl WizardStepMachine {
    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn expect(&self, expected: WizardStep) -> Result<(), RegistrationError> {
        if self.step != expected {
            return Err(RegistrationError::step_violation(
                expected.name(),
                self.step.name(),
            ));
        }
        Ok(())
    }

    pub fn mark_info(&mut self) -> Result<(), RegistrationError> {
        self.advance(WizardStep::Terms, WizardStep::Info)
    }

    pub fn mark_category(&mut self) -> Result<(), RegistrationError> {
        self.advance(WizardStep::Info, WizardStep::Category)
    }

    pub fn mark_payment(&mut self) -> Result<(), RegistrationError> {
        self.advance(WizardStep::Category, WizardStep::Payment)
    }

    pub fn mark_complete(&mut self) -> Result<(), RegistrationError> {
        self.advance(WizardStep::Payment, WizardStep::Complete)
    }

    /// Jump to a step recovered from a saved draft.
    pub fn restore(&mut self, step: WizardStep) {
        self.step = step;
    }

    fn advance(&mut self, expected: WizardStep, next: WizardStep) -> Result<(), RegistrationError> {
        self.expect(expected)?;
        self.step = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoOutcome {
    Continue,
    /// The email already belongs to an account; the attendee should sign in instead.
    RedirectToLogin { email: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradeSelection {
    NoVerificationNeeded,
    VerificationRequired,
    AlreadyVerified,
}

/// Registration ready for the payment step.
#[derive(Debug, Clone)]
pub struct PaymentReady {
    pub registration: Registration,
    pub link: LinkOutcome,
}

/// Draft state still to be applied after the form data.
#[derive(Debug, Clone)]
pub struct PendingRestore {
    pub registration_id: Option<String>,
    pub agreements: Agreements,
    pub member_verification_data: Option<MemberVerificationSnapshot>,
    pub step: WizardStep,
}

pub struct RegistrationWizard {
    store: Arc<dyn DocumentStore>,
    identity: Arc<IdentityBridge>,
    clock: Arc<dyn Clock>,
    conference: Conference,
    session: IdentitySession,
    machine: WizardStepMachine,
    agreements: Agreements,
    form_data: FormData,
    grade: Option<Grade>,
    verification: Option<MemberVerificationSnapshot>,
    registration: Option<Registration>,
}

impl RegistrationWizard {
    /// Open the wizard. Fails when the attendee already holds a paid registration.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        identity: Arc<IdentityBridge>,
        clock: Arc<dyn Clock>,
        conference: Conference,
        session: IdentitySession,
    ) -> Result<Self, RegistrationError> {
        let wizard = Self {
            store,
            identity,
            clock,
            conference,
            session,
            machine: WizardStepMachine::default(),
            agreements: Agreements::new(),
            form_data: FormData::default(),
            grade: None,
            verification: None,
            registration: None,
        };
        wizard.ensure_can_enter().await?;
        Ok(wizard)
    }

    pub fn step(&self) -> WizardStep {
        self.machine.step()
    }

    pub fn session(&self) -> &IdentitySession {
        &self.session
    }

    pub fn form_data(&self) -> &FormData {
        &self.form_data
    }

    pub fn agreements(&self) -> &Agreements {
        &self.agreements
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn is_verified(&self) -> bool {
        self.verification.is_some()
    }

    pub async fn ensure_can_enter(&self) -> Result<(), RegistrationError> {
        let existing = self.existing_registrations().await?;
        if existing.iter().any(Registration::is_finalized) {
            return Err(RegistrationError::Conflict("already registered".to_string()));
        }
        Ok(())
    }

    /// Registrations the signed-in user already holds for this conference.
    async fn existing_registrations(&self) -> Result<Vec<Registration>, RegistrationError> {
        if self.session.identity().is_none() {
            return Ok(Vec::new());
        }
        self.store
            .find_registrations(&self.session.user_id(), &self.conference.id)
            .await
    }

    /// Step 0 -> 1. Only clauses with text that are marked required are enforced.
    pub async fn accept_terms(&mut self, agreements: Agreements) -> Result<(), RegistrationError> {
        self.machine.expect(WizardStep::Terms)?;
        if let Some(clause) = self
            .conference
            .consent_clauses
            .iter()
            .filter(|clause| clause.is_enforced())
            .find(|clause| !agreements.get(&clause.key).copied().unwrap_or(false))
        {
            return Err(RegistrationError::InvalidArgument(format!(
                "consent to '{}' is required",
                clause.key
            )));
        }

        self.agreements = agreements;
        self.machine.mark_info()?;
        self.autosave().await;
        Ok(())
    }

    /// Step 1 -> 2. Attendees without an account must supply a guest password for an unused email.
    pub async fn submit_info(
        &mut self,
        info: PersonalInfo,
        guest_password: Option<&str>,
    ) -> Result<InfoOutcome, RegistrationError> {
        self.machine.expect(WizardStep::Info)?;
        validate_info(&info)?;

        if !self.session.is_authenticated() {
            let password = guest_password
                .filter(|password| !password.is_empty())
                .ok_or_else(|| RegistrationError::invalid("guest password is required"))?;
            if self.identity.check_email_exists(&info.email).await? {
                debug!(conference_id = %self.conference.id, "email belongs to an account");
                return Ok(InfoOutcome::RedirectToLogin {
                    email: info.email.trim().to_string(),
                });
            }
            self.identity.ensure_session(&mut self.session).await?;
            self.identity
                .set_guest_password(&mut self.session, &info.email, &self.conference.id, password)
                .await?;
        }

        self.form_data.info = Some(info);
        self.machine.mark_category()?;
        self.autosave().await;
        Ok(InfoOutcome::Continue)
    }

    pub fn select_grade(&mut self, grade_id: &str) -> Result<GradeSelection, RegistrationError> {
        self.machine.expect(WizardStep::Category)?;
        let grade = self
            .conference
            .grade(grade_id)
            .cloned()
            .ok_or_else(|| RegistrationError::InvalidArgument(format!("unknown grade '{grade_id}'")))?;

        let selection = if !grade.requires_verification() {
            self.verification = None;
            GradeSelection::NoVerificationNeeded
        } else if self.verification.is_some() {
            GradeSelection::AlreadyVerified
        } else {
            GradeSelection::VerificationRequired
        };

        self.form_data.grade_id = Some(grade.id.clone());
        self.grade = Some(grade);
        Ok(selection)
    }

    /// Record a successful verification; a grade matched from the roster replaces the selection.
    pub fn apply_verification(&mut self, outcome: &VerifyOutcome) -> Result<(), RegistrationError> {
        self.machine.expect(WizardStep::Category)?;
        if !outcome.success {
            return Err(RegistrationError::InvalidArgument(outcome.message.clone()));
        }
        let snapshot = outcome
            .credential_snapshot
            .clone()
            .ok_or_else(|| RegistrationError::invalid("verification result has no credential"))?;

        if let Some(grade) = outcome.grade.as_ref() {
            self.form_data.grade_id = Some(grade.id.clone());
            self.grade = Some(grade.clone());
        }
        self.verification = Some(snapshot);
        Ok(())
    }

    /// Step 2 -> 3. Prices the selected grade and writes the PENDING registration.
    pub async fn proceed_to_payment(&mut self) -> Result<PaymentReady, RegistrationError> {
        self.machine.expect(WizardStep::Category)?;
        let grade = self
            .grade
            .clone()
            .ok_or_else(|| RegistrationError::invalid("select a registration grade first"))?;
        if grade.requires_verification() && !self.is_verified() {
            return Err(RegistrationError::invalid(
                "member verification is required for this grade",
            ));
        }

        let now = self.clock.now();
        let amount = self
            .conference
            .active_period(now)
            .ok_or_else(|| RegistrationError::invalid("registration is not open"))?
            .price_for(&grade.id);

        // A second tab or a resumed session reuses the pending registration of this user.
        let existing = self.existing_registrations().await?;
        if existing.iter().any(Registration::is_finalized) {
            return Err(RegistrationError::Conflict("already registered".to_string()));
        }
        let current = self
            .registration
            .clone()
            .filter(|registration| registration.status == RegistrationStatus::Pending)
            .or_else(|| {
                existing
                    .into_iter()
                    .filter(|registration| registration.status == RegistrationStatus::Pending)
                    .max_by_key(|registration| registration.updated_at)
            });

        let mut registration = match current {
            Some(mut existing) => {
                existing.tier = grade.id.clone();
                existing.tier_name = grade.name.clone();
                existing.amount = amount;
                existing.order_id = generate_order_id(&self.conference.order_prefix, now);
                existing.updated_at = now;
                existing
            }
            None => Registration::new_pending(&self.conference, self.session.user_id(), &grade, amount, now),
        };
        registration.anonymous = self.session.is_anonymous();
        registration.agreements = self.agreements.clone();
        registration.form_data = self.form_data.clone();
        registration.member_verification_data = self.verification.clone();
        registration.current_step = WizardStep::Payment.index();
        self.store.put_registration(&registration).await?;

        let info = self.form_data.info.clone().unwrap_or_default();
        if registration.is_guest() && !info.email.is_empty() {
            if let Err(err) = self
                .identity
                .attach_guest_registration(&info.email, &self.conference.id, &registration.id)
                .await
            {
                warn!(registration_id = %registration.id, error = %err, "guest lookup update failed");
            }
        }
        let link = self
            .identity
            .link_for_payment(&mut self.session, &mut registration, &info)
            .await;

        info!(
            registration_id = %registration.id,
            order_id = %registration.order_id,
            amount = registration.amount,
            "registration awaiting payment"
        );
        self.registration = Some(registration.clone());
        self.machine.mark_payment()?;
        self.autosave().await;
        Ok(PaymentReady { registration, link })
    }

    /// Step 3 -> 4. Only a successful server-side confirmation completes the wizard.
    pub async fn observe_confirmation(
        &mut self,
        outcome: &ConfirmationOutcome,
    ) -> Result<(), RegistrationError> {
        self.machine.expect(WizardStep::Payment)?;
        let registration = self
            .registration
            .as_mut()
            .ok_or_else(|| RegistrationError::step_violation("payment", "no registration"))?;
        if outcome.registration_id != registration.id {
            return Err(RegistrationError::invalid(
                "confirmation is for a different registration",
            ));
        }
        if !outcome.success {
            return Err(RegistrationError::InvalidArgument(outcome.message.clone()));
        }

        registration.status = RegistrationStatus::Completed;
        registration.current_step = WizardStep::Complete.index();
        self.machine.mark_complete()?;
        self.autosave().await;
        Ok(())
    }

    /// Load a saved draft for a signed-in attendee.
    ///
    /// Form data is applied immediately; the rest waits for [`Self::finish_restore`] so
    /// the form can render before the step jumps.
    pub async fn resume(&mut self) -> Result<Option<PendingRestore>, RegistrationError> {
        if !self.session.is_authenticated() {
            return Ok(None);
        }
        let user_id = self.session.user_id();
        let pending = self
            .store
            .find_registrations(&user_id, &self.conference.id)
            .await?
            .into_iter()
            .find(|registration| registration.status == RegistrationStatus::Pending);
        let key = WizardDraft::key_for(
            pending.as_ref().map(|registration| registration.id.as_str()),
            &user_id,
            &self.conference.id,
        );

        let Some(draft) = self.store.load_draft(&key).await? else {
            return Ok(None);
        };
        let step = WizardStep::from_index(draft.current_step).unwrap_or(WizardStep::Terms);

        self.grade = draft
            .form_data
            .grade_id
            .as_deref()
            .and_then(|grade_id| self.conference.grade(grade_id))
            .cloned();
        self.form_data = draft.form_data;
        self.registration = pending;

        Ok(Some(PendingRestore {
            registration_id: draft.registration_id,
            agreements: draft.agreements,
            member_verification_data: draft.member_verification_data,
            step,
        }))
    }

    pub fn finish_restore(&mut self, pending: PendingRestore) {
        self.agreements = pending.agreements;
        self.verification = pending.member_verification_data;
        self.machine.restore(pending.step);
        debug!(step = pending.step.name(), "wizard draft restored");
    }

    async fn autosave(&self) {
        let registration_id = self.registration.as_ref().map(|r| r.id.clone());
        let user_id = self.session.user_id();
        let draft = WizardDraft {
            draft_key: WizardDraft::key_for(registration_id.as_deref(), &user_id, &self.conference.id),
            registration_id,
            user_id,
            conference_id: self.conference.id.clone(),
            current_step: self.machine.step().index(),
            form_data: self.form_data.clone(),
            agreements: self.agreements.clone(),
            member_verification_data: self.verification.clone(),
            saved_at: self.clock.now(),
        };
        if let Err(err) = self.store.save_draft(&draft).await {
            warn!(draft_key = %draft.draft_key, error = %err, "wizard autosave failed");
        }
    }
}

fn validate_info(info: &PersonalInfo) -> Result<(), RegistrationError> {
    for (field, value) in [
        ("name", &info.name),
        ("email", &info.email),
        ("phone", &info.phone),
    ] {
        if value.trim().is_empty() {
            return Err(RegistrationError::InvalidArgument(format!("{field} is required")));
        }
    }
    match info.email.trim().split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(RegistrationError::invalid("email address is malformed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credential::{CredentialVerifier, VerifyRequest};
    use crate::gateway::{GatewayRegistry, PaymentResult};
    use crate::identity::{Identity, IdentityError};
    use crate::reconciler::{ConfirmationRequest, PaymentReconciler};
    use crate::storage::MemoryDocumentStore;
    use crate::testing::{FakeIdentityProvider, FaultyStore, ScriptedGateway};
    use crate::types::{ConsentClause, Credential, PaymentStatus, RegistrationPeriod};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap()
    }

    fn conference() -> Conference {
        Conference {
            id: "conf-1".to_string(),
            org_id: "org1".to_string(),
            slug: "spring".to_string(),
            title: "Spring Meeting".to_string(),
            order_prefix: "KSA".to_string(),
            periods: vec![RegistrationPeriod {
                id: "early".to_string(),
                name: "Early".to_string(),
                starts_at: now() - Duration::days(10),
                ends_at: now() + Duration::days(10),
                prices: BTreeMap::from([
                    ("member".to_string(), 50_000),
                    ("guest".to_string(), 80_000),
                ]),
            }],
            grades: vec![
                Grade::new("member", "MEMBER", "Member"),
                Grade::new("guest", "NON_MEMBER", "Non-member"),
            ],
            consent_clauses: vec![
                ConsentClause {
                    key: "privacy".to_string(),
                    text: "We store your details.".to_string(),
                    required: true,
                },
                ConsentClause {
                    key: "marketing".to_string(),
                    text: "Newsletter".to_string(),
                    required: false,
                },
                ConsentClause {
                    key: "third_party".to_string(),
                    text: String::new(),
                    required: true,
                },
            ],
        }
    }

    fn info() -> PersonalInfo {
        PersonalInfo {
            name: "Kim".to_string(),
            email: "kim@example.org".to_string(),
            phone: "010-1234-5678".to_string(),
            affiliation: Some("Seoul Clinic".to_string()),
            license_number: Some("123".to_string()),
        }
    }

    fn agreements() -> Agreements {
        Agreements::from([("privacy".to_string(), true)])
    }

    struct Harness {
        store: Arc<dyn DocumentStore>,
        bridge: Arc<IdentityBridge>,
        clock: Arc<dyn Clock>,
    }

    impl Harness {
        fn new(provider: FakeIdentityProvider) -> Self {
            Self::with_store(Arc::new(MemoryDocumentStore::new()), provider)
        }

        fn with_store(store: Arc<dyn DocumentStore>, provider: FakeIdentityProvider) -> Self {
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
            let bridge = Arc::new(IdentityBridge::new(
                Arc::new(provider),
                store.clone(),
                clock.clone(),
            ));
            Self {
                store,
                bridge,
                clock,
            }
        }

        async fn wizard(&self, session: IdentitySession) -> Result<RegistrationWizard, RegistrationError> {
            self.wizard_for(conference(), session).await
        }

        async fn wizard_for(
            &self,
            conference: Conference,
            session: IdentitySession,
        ) -> Result<RegistrationWizard, RegistrationError> {
            RegistrationWizard::start(
                self.store.clone(),
                self.bridge.clone(),
                self.clock.clone(),
                conference,
                session,
            )
            .await
        }
    }

    fn member_session() -> IdentitySession {
        IdentitySession::with_identity(Identity::account("user-1", "kim@example.org"))
    }

    #[test]
    fn step_machine_rejects_skips() {
        let mut machine = WizardStepMachine::default();
        let err = machine.mark_category().unwrap_err();
        assert!(err.to_string().contains("expected 'info', got 'terms'"));
        machine.mark_info().unwrap();
        machine.mark_category().unwrap();
        machine.mark_payment().unwrap();
        machine.mark_complete().unwrap();
        assert_eq!(machine.step().index(), 4);
    }

    #[tokio::test]
    async fn required_clauses_with_text_must_be_accepted() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut wizard = harness.wizard(member_session()).await.unwrap();

        let err = wizard.accept_terms(Agreements::new()).await.unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
        assert_eq!(wizard.step(), WizardStep::Terms);

        wizard.accept_terms(agreements()).await.unwrap();
        assert_eq!(wizard.step(), WizardStep::Info);
    }

    #[tokio::test]
    async fn info_cannot_be_submitted_before_terms() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        let err = wizard.submit_info(info(), None).await.unwrap_err();
        assert_eq!(err.code(), "failed-precondition");
    }

    #[tokio::test]
    async fn member_grade_requires_verification_before_payment() {
        let harness = Harness::new(FakeIdentityProvider::default());
        harness
            .store
            .put_credential(&Credential {
                id: "M1".to_string(),
                org_id: "org1".to_string(),
                name: "Kim".to_string(),
                license_number: Some("123".to_string()),
                code: None,
                grade: Some("Member".to_string()),
                used: false,
                used_by: None,
                used_at: None,
                expiry: Some(now() + Duration::days(30)),
            })
            .await
            .unwrap();
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();

        assert_eq!(
            wizard.select_grade("member").unwrap(),
            GradeSelection::VerificationRequired
        );
        let err = wizard.proceed_to_payment().await.unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
        assert_eq!(wizard.step(), WizardStep::Category);

        let verifier = CredentialVerifier::new(harness.store.clone(), harness.clock.clone());
        let outcome = verifier
            .verify(
                &VerifyRequest {
                    org_id: "org1".to_string(),
                    name: "Kim".to_string(),
                    code: "123".to_string(),
                    consent_given: true,
                    ..VerifyRequest::default()
                },
                &conference().grades,
                Some("user-1"),
            )
            .await
            .unwrap();
        wizard.apply_verification(&outcome).unwrap();

        let ready = wizard.proceed_to_payment().await.unwrap();
        assert_eq!(ready.registration.amount, 50_000);
        assert_eq!(ready.link, LinkOutcome::NotAttempted);
        assert_eq!(
            ready.registration.member_verification_data.unwrap().id,
            "M1"
        );
        assert_eq!(wizard.step(), WizardStep::Payment);
    }

    #[tokio::test]
    async fn non_member_grade_never_asks_for_verification() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();

        assert_eq!(
            wizard.select_grade("guest").unwrap(),
            GradeSelection::NoVerificationNeeded
        );
        let ready = wizard.proceed_to_payment().await.unwrap();
        assert_eq!(ready.registration.amount, 80_000);
        assert!(ready.registration.member_verification_data.is_none());
    }

    #[tokio::test]
    async fn existing_account_email_redirects_to_login() {
        let harness = Harness::new(FakeIdentityProvider::with_account("kim@example.org").await);
        let mut wizard = harness.wizard(IdentitySession::empty()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();

        let missing_password = wizard.submit_info(info(), None).await.unwrap_err();
        assert_eq!(missing_password.code(), "invalid-argument");

        let outcome = wizard.submit_info(info(), Some("secret1")).await.unwrap();
        assert_eq!(
            outcome,
            InfoOutcome::RedirectToLogin {
                email: "kim@example.org".to_string()
            }
        );
        assert_eq!(wizard.step(), WizardStep::Info);
    }

    #[tokio::test]
    async fn paid_registration_blocks_entry() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let conf = conference();
        let mut paid = Registration::new_pending(&conf, "user-1", &conf.grades[1], 80_000, now());
        paid.payment_status = PaymentStatus::Paid;
        harness.store.put_registration(&paid).await.unwrap();

        let err = harness.wizard(member_session()).await.err().unwrap();
        assert_eq!(err.code(), "already-exists");
    }

    #[tokio::test]
    async fn second_wizard_reuses_pending_registration() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut first = harness.wizard(member_session()).await.unwrap();
        first.accept_terms(agreements()).await.unwrap();
        first.submit_info(info(), None).await.unwrap();
        first.select_grade("guest").unwrap();
        let original = first.proceed_to_payment().await.unwrap().registration;

        let mut second = harness.wizard(member_session()).await.unwrap();
        second.accept_terms(agreements()).await.unwrap();
        second.submit_info(info(), None).await.unwrap();
        second.select_grade("guest").unwrap();
        let reused = second.proceed_to_payment().await.unwrap().registration;

        assert_eq!(reused.id, original.id);
        let stored = harness
            .store
            .find_registrations("user-1", "conf-1")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn registration_paid_elsewhere_blocks_payment_step() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();
        wizard.select_grade("guest").unwrap();

        let conf = conference();
        let mut paid = Registration::new_pending(&conf, "user-1", &conf.grades[1], 80_000, now());
        paid.payment_status = PaymentStatus::Paid;
        harness.store.put_registration(&paid).await.unwrap();

        let err = wizard.proceed_to_payment().await.unwrap_err();
        assert_eq!(err.code(), "already-exists");
        assert_eq!(wizard.step(), WizardStep::Category);
    }

    #[tokio::test]
    async fn payment_is_refused_outside_registration_period() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut closed = conference();
        for period in &mut closed.periods {
            period.starts_at = now() - Duration::days(30);
            period.ends_at = now() - Duration::days(20);
        }
        let mut wizard = harness.wizard_for(closed, member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();
        wizard.select_grade("guest").unwrap();

        let err = wizard.proceed_to_payment().await.unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
        assert!(err.to_string().contains("not open"));
        assert_eq!(wizard.step(), WizardStep::Category);
        assert!(harness
            .store
            .find_registrations("user-1", "conf-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn draft_save_failure_does_not_block_progress() {
        let harness = Harness::with_store(
            Arc::new(FaultyStore::failing_drafts()),
            FakeIdentityProvider::default(),
        );
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();
        wizard.select_grade("guest").unwrap();
        let ready = wizard.proceed_to_payment().await.unwrap();

        assert_eq!(wizard.step(), WizardStep::Payment);
        assert_eq!(ready.registration.amount, 80_000);
        let mut resumed = harness.wizard(member_session()).await.unwrap();
        assert!(resumed.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn autosave_round_trip_restores_in_two_phases() {
        let harness = Harness::new(FakeIdentityProvider::default());
        let mut wizard = harness.wizard(member_session()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), None).await.unwrap();
        wizard.select_grade("guest").unwrap();
        wizard.proceed_to_payment().await.unwrap();

        let mut resumed = harness.wizard(member_session()).await.unwrap();
        let pending = resumed.resume().await.unwrap().unwrap();
        assert_eq!(resumed.form_data().info, Some(info()));
        assert_eq!(resumed.step(), WizardStep::Terms);
        assert!(resumed.agreements().is_empty());

        resumed.finish_restore(pending);
        assert_eq!(resumed.step(), WizardStep::Payment);
        assert_eq!(resumed.agreements(), &agreements());
        assert!(resumed.registration().is_some());
    }

    #[tokio::test]
    async fn guest_completes_payment_when_account_upgrade_fails() {
        let harness = Harness::new(FakeIdentityProvider::failing_link(
            IdentityError::EmailAlreadyInUse,
        ));
        let mut wizard = harness.wizard(IdentitySession::empty()).await.unwrap();
        wizard.accept_terms(agreements()).await.unwrap();
        wizard.submit_info(info(), Some("secret1")).await.unwrap();
        let anonymous_id = wizard.session().user_id();
        assert!(anonymous_id.starts_with("anon-"));

        wizard.select_grade("guest").unwrap();
        let ready = wizard.proceed_to_payment().await.unwrap();
        assert!(matches!(ready.link, LinkOutcome::StayedGuest { .. }));
        assert_eq!(ready.registration.user_id, anonymous_id);

        let mut gateways = GatewayRegistry::new();
        gateways.register(Arc::new(ScriptedGateway {
            result: PaymentResult::Approved {
                transaction_ref: "tid-9".to_string(),
                amount: 80_000,
                raw: json!({"ResultCode": "3001"}),
            },
        }));
        let reconciler = PaymentReconciler::new(
            harness.store.clone(),
            Arc::new(gateways),
            Arc::new(CredentialVerifier::new(harness.store.clone(), harness.clock.clone())),
            harness.clock.clone(),
        );
        let outcome = reconciler
            .confirm(&ConfirmationRequest {
                provider: "scripted".to_string(),
                registration_id: ready.registration.id.clone(),
                conference_id: "conf-1".to_string(),
                transaction_ref: "tid-9".to_string(),
                amount: 80_000,
                payload: Value::Null,
            })
            .await
            .unwrap();
        wizard.observe_confirmation(&outcome).await.unwrap();
        assert_eq!(wizard.step(), WizardStep::Complete);

        let stored = harness
            .store
            .get_registration(&ready.registration.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RegistrationStatus::Completed);
        assert_eq!(stored.user_id, anonymous_id);

        let resumed = harness
            .bridge
            .resume_guest_registration("kim@example.org", "secret1", "conf-1")
            .await
            .unwrap();
        assert_eq!(resumed.id, stored.id);
    }
}
