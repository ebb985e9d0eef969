//! Membership credential verification and one-time claim locking.

use crate::clock::Clock;
use crate::error::RegistrationError;
use crate::identity::MIN_GUEST_PASSWORD_LEN;
use crate::storage::{ClaimOutcome, ClaimReason, CredentialKeyField, DocumentStore};
use crate::types::{normalize_label, Credential, Grade, MemberVerificationSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const MSG_VERIFIED: &str = "Verified";
pub const MSG_NOT_FOUND: &str = "Member not found";
pub const MSG_EXPIRED: &str = "Expired Code";
pub const MSG_ALREADY_USED: &str = "Code Already Used";
pub const MSG_GRADE_MISMATCH: &str = "Grade mismatch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub org_id: String,
    pub name: String,
    pub code: String,
    pub consent_given: bool,
    pub requested_grade: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub guest_password: Option<String>,
    #[serde(default)]
    pub lock_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub success: bool,
    pub grade: Option<Grade>,
    pub credential_snapshot: Option<MemberVerificationSnapshot>,
    pub message: String,
}

impl VerifyOutcome {
    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            grade: None,
            credential_snapshot: None,
            message: message.to_string(),
        }
    }
}

/// Pick the local grade matching a roster grade label.
///
/// Labels are normalized (lowercase, no whitespace). Exact code equality wins over exact
/// name equality, which wins over substring matches on name and then code. Grades that need no
/// verification only match exactly, so "Member" never lands on "Non-member".
pub fn match_grade<'a>(reported: &str, grades: &'a [Grade]) -> Option<&'a Grade> {
    let target = normalize_label(reported);
    if target.is_empty() {
        return None;
    }

    grades
        .iter()
        .filter_map(|grade| {
            let code = normalize_label(&grade.code);
            let name = normalize_label(&grade.name);
            let overlaps = |label: &str| {
                !label.is_empty() && (label.contains(&target) || target.contains(label))
            };
            let rank = if code == target {
                0
            } else if name == target {
                1
            } else if !grade.requires_verification() {
                return None;
            } else if overlaps(&name) {
                2
            } else if overlaps(&code) {
                3
            } else {
                return None;
            };
            Some((rank, grade))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, grade)| grade)
}

/// Validates membership claims against an organization's roster.
pub struct CredentialVerifier {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Verify a `(name, code)` claim. `grades` are the conference's known tiers used for
    /// auto-selection; `caller` is the authenticated identity, if any.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
        grades: &[Grade],
        caller: Option<&str>,
    ) -> Result<VerifyOutcome, RegistrationError> {
        if !request.consent_given {
            return Err(RegistrationError::invalid(
                "consent to membership lookup is required",
            ));
        }
        let name = request.name.trim();
        let code = request.code.trim();
        if request.org_id.trim().is_empty() || name.is_empty() || code.is_empty() {
            return Err(RegistrationError::invalid(
                "orgId, name and code are required",
            ));
        }
        if let Some(password) = request.guest_password.as_deref() {
            if password.chars().count() < MIN_GUEST_PASSWORD_LEN {
                return Err(RegistrationError::invalid(
                    "guest password must be at least 6 characters",
                ));
            }
        }
        if request.lock_immediately && caller.is_none() {
            return Err(RegistrationError::Unauthenticated(
                "locking a credential requires a signed-in caller".to_string(),
            ));
        }

        let Some(credential) = self.lookup(&request.org_id, name, code).await? else {
            return Ok(VerifyOutcome::rejected(MSG_NOT_FOUND));
        };

        let now = self.clock.now();
        if credential.is_expired(now) {
            return Ok(VerifyOutcome::rejected(MSG_EXPIRED));
        }
        if credential.used && credential.used_by.as_deref() != caller {
            return Ok(VerifyOutcome::rejected(MSG_ALREADY_USED));
        }

        let grade = match self.resolve_grade(&credential, request, grades) {
            Ok(grade) => grade,
            Err(message) => return Ok(VerifyOutcome::rejected(message)),
        };

        if request.lock_immediately {
            if let Some(claimant) = caller {
                match self
                    .claim(&request.org_id, &credential.id, claimant, ClaimReason::Verification)
                    .await?
                {
                    ClaimOutcome::Claimed(_) | ClaimOutcome::AlreadyOwned(_) => {}
                    ClaimOutcome::HeldByOther { .. } => {
                        return Ok(VerifyOutcome::rejected(MSG_ALREADY_USED))
                    }
                    ClaimOutcome::Expired => return Ok(VerifyOutcome::rejected(MSG_EXPIRED)),
                    ClaimOutcome::NotFound => return Ok(VerifyOutcome::rejected(MSG_NOT_FOUND)),
                }
            }
        }

        let snapshot = MemberVerificationSnapshot {
            id: credential.id.clone(),
            org_id: Some(request.org_id.clone()),
            name: credential.name.clone(),
            code: code.to_string(),
            grade: credential.grade.clone(),
            verified_at: now,
            contact_email: request.contact_email.clone(),
            contact_phone: request.contact_phone.clone(),
        };

        Ok(VerifyOutcome {
            success: true,
            grade,
            credential_snapshot: Some(snapshot),
            message: MSG_VERIFIED.to_string(),
        })
    }

    /// Claim a credential for `claimant` as an atomic compare-and-swap on `(used, used_by)`.
    ///
    /// Both lock points (verification and payment) go through here.
    pub async fn claim(
        &self,
        org_id: &str,
        credential_id: &str,
        claimant: &str,
        reason: ClaimReason,
    ) -> Result<ClaimOutcome, RegistrationError> {
        let outcome = self
            .store
            .claim_credential(org_id, credential_id, claimant, self.clock.now())
            .await?;

        match &outcome {
            ClaimOutcome::Claimed(_) => info!(
                org_id = org_id,
                credential_id = credential_id,
                claimant = claimant,
                reason = ?reason,
                "Credential locked"
            ),
            ClaimOutcome::AlreadyOwned(_) => {}
            ClaimOutcome::HeldByOther { used_by } => warn!(
                org_id = org_id,
                credential_id = credential_id,
                claimant = claimant,
                used_by = %used_by,
                reason = ?reason,
                "Credential already held by another identity"
            ),
            ClaimOutcome::Expired | ClaimOutcome::NotFound => warn!(
                org_id = org_id,
                credential_id = credential_id,
                reason = ?reason,
                outcome = ?outcome,
                "Credential claim not possible"
            ),
        }

        Ok(outcome)
    }

    async fn lookup(
        &self,
        org_id: &str,
        name: &str,
        code: &str,
    ) -> Result<Option<Credential>, RegistrationError> {
        for field in CredentialKeyField::LOOKUP_ORDER {
            if let Some(found) = self.store.find_credential(org_id, field, name, code).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn resolve_grade(
        &self,
        credential: &Credential,
        request: &VerifyRequest,
        grades: &[Grade],
    ) -> Result<Option<Grade>, &'static str> {
        let requested = request
            .requested_grade
            .as_deref()
            .and_then(|id| grades.iter().find(|grade| grade.id == id));

        let matched = credential
            .grade
            .as_deref()
            .and_then(|label| match_grade(label, grades));

        match (matched, requested) {
            (Some(matched), Some(requested)) if matched.id != requested.id => {
                Err(MSG_GRADE_MISMATCH)
            }
            (Some(matched), _) => Ok(Some(matched.clone())),
            (None, requested) => Ok(requested.cloned()),
        }
    }
}
