use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::RegistrationError;

/// Sentinel `user_id` for registrations that are not bound to an account.
pub const GUEST_USER_ID: &str = "GUEST";

/// Lowercase and strip all whitespace so roster labels compare loosely.
pub fn normalize_label(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Build an externally visible order id: `{orgPrefix}-{yyyymmdd}-{rand4}`.
pub fn generate_order_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{}-{}-{}", prefix, now.format("%Y%m%d"), suffix)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    PartialRefunded,
}

/// Fee window of a conference; `prices` maps grade id to amount in minor units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationPeriod {
    pub id: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub prices: BTreeMap<String, u64>,
}

impl RegistrationPeriod {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now <= self.ends_at
    }

    pub fn price_for(&self, grade_id: &str) -> u64 {
        self.prices.get(grade_id).copied().unwrap_or(0)
    }
}

/// Registration fee tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grade {
    pub id: String,
    pub code: String,
    pub name: String,
}

const NO_VERIFICATION_MARKERS: [&str; 3] = ["non-member", "nonmember", "non_member"];
const NO_VERIFICATION_MARKER_KO: &str = "비회원";

impl Grade {
    pub fn new(id: impl Into<String>, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            name: name.into(),
        }
    }

    /// Only the non-member tier skips credential verification.
    pub fn requires_verification(&self) -> bool {
        let labels = [normalize_label(&self.code), normalize_label(&self.name)];
        !labels.iter().any(|label| {
            label.contains(NO_VERIFICATION_MARKER_KO)
                || NO_VERIFICATION_MARKERS
                    .iter()
                    .any(|marker| label.contains(marker))
        })
    }
}

/// A consent clause shown on the terms step. Empty text means the organization omitted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentClause {
    pub key: String,
    pub text: String,
    pub required: bool,
}

impl ConsentClause {
    pub fn is_enforced(&self) -> bool {
        self.required && !self.text.trim().is_empty()
    }
}

/// Society running conferences; `domains` feed the origin allow-list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conference {
    pub id: String,
    pub org_id: String,
    pub slug: String,
    pub title: String,
    pub order_prefix: String,
    pub periods: Vec<RegistrationPeriod>,
    pub grades: Vec<Grade>,
    pub consent_clauses: Vec<ConsentClause>,
}

impl Conference {
    /// The active period for `now`. Overlapping windows are a data error; the latest start wins.
    pub fn active_period(&self, now: DateTime<Utc>) -> Option<&RegistrationPeriod> {
        self.periods
            .iter()
            .filter(|period| period.is_active(now))
            .max_by_key(|period| period.starts_at)
    }

    pub fn grade(&self, grade_id: &str) -> Option<&Grade> {
        self.grades.iter().find(|grade| grade.id == grade_id)
    }
}

/// Roster record proving membership, one-time use with expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub license_number: Option<String>,
    pub code: Option<String>,
    pub grade: Option<String>,
    pub used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|expiry| expiry < now).unwrap_or(false)
    }
}

/// Snapshot of a credential claim copied into the registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberVerificationSnapshot {
    pub id: String,
    pub org_id: Option<String>,
    pub name: String,
    pub code: String,
    pub grade: Option<String>,
    pub verified_at: DateTime<Utc>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
}

/// Per-clause consent flags keyed by clause key.
pub type Agreements = BTreeMap<String, bool>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonalInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub affiliation: Option<String>,
    pub license_number: Option<String>,
}

/// Wizard draft state persisted for resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormData {
    pub info: Option<PersonalInfo>,
    pub grade_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    pub id: String,
    pub conference_id: String,
    pub org_id: String,
    pub user_id: String,
    /// True while `user_id` names an anonymous session rather than an account.
    #[serde(default)]
    pub anonymous: bool,
    pub order_id: String,
    pub status: RegistrationStatus,
    pub payment_status: PaymentStatus,
    pub tier: String,
    pub tier_name: String,
    pub amount: u64,
    pub refunded_amount: u64,
    pub member_verification_data: Option<MemberVerificationSnapshot>,
    pub agreements: Agreements,
    pub current_step: u8,
    pub form_data: FormData,
    pub payment_provider: Option<String>,
    pub payment_details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Registration {
    pub fn new_pending(
        conference: &Conference,
        user_id: impl Into<String>,
        grade: &Grade,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conference_id: conference.id.clone(),
            org_id: conference.org_id.clone(),
            user_id: user_id.into(),
            anonymous: false,
            order_id: generate_order_id(&conference.order_prefix, now),
            status: RegistrationStatus::Pending,
            payment_status: PaymentStatus::Pending,
            tier: grade.id.clone(),
            tier_name: grade.name.clone(),
            amount,
            refunded_amount: 0,
            member_verification_data: None,
            agreements: Agreements::new(),
            current_step: 0,
            form_data: FormData::default(),
            payment_provider: None,
            payment_details: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    /// Guests have no durable account: either the sentinel id or an anonymous session.
    pub fn is_guest(&self) -> bool {
        self.anonymous || self.user_id == GUEST_USER_ID
    }

    /// Paid or completed registrations block a second registration for the same user.
    pub fn is_finalized(&self) -> bool {
        self.status == RegistrationStatus::Completed
            || matches!(
                self.payment_status,
                PaymentStatus::Paid | PaymentStatus::PartialRefunded
            )
    }

    pub fn apply_refund(&mut self, amount: u64, now: DateTime<Utc>) -> Result<(), RegistrationError> {
        if !matches!(
            self.payment_status,
            PaymentStatus::Paid | PaymentStatus::PartialRefunded
        ) {
            return Err(RegistrationError::InvalidArgument(format!(
                "registration '{}' has no captured payment to refund",
                self.id
            )));
        }
        if amount == 0 {
            return Err(RegistrationError::invalid("refund amount must be positive"));
        }
        let total = self.refunded_amount.saturating_add(amount);
        if total > self.amount {
            return Err(RegistrationError::InvalidArgument(format!(
                "refund total {} exceeds paid amount {}",
                total, self.amount
            )));
        }

        self.refunded_amount = total;
        self.payment_status = if total == self.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartialRefunded
        };
        self.updated_at = now;
        Ok(())
    }
}

/// Append-only attendance record stored under an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipationHistoryEntry {
    pub registration_id: String,
    pub conference_id: String,
    pub conference_title: String,
    pub tier: String,
    pub amount: u64,
    pub order_id: String,
    pub paid_at: DateTime<Utc>,
}

/// Low-assurance lookup record that lets a guest find their registration again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestLookupRecord {
    pub email: String,
    pub conference_id: String,
    pub registration_id: Option<String>,
    pub password_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub affiliation: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Autosaved wizard state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WizardDraft {
    pub draft_key: String,
    pub registration_id: Option<String>,
    pub user_id: String,
    pub conference_id: String,
    pub current_step: u8,
    pub form_data: FormData,
    pub agreements: Agreements,
    pub member_verification_data: Option<MemberVerificationSnapshot>,
    pub saved_at: DateTime<Utc>,
}

impl WizardDraft {
    /// Drafts saved before a registration exists are keyed by user and conference.
    pub fn key_for(registration_id: Option<&str>, user_id: &str, conference_id: &str) -> String {
        match registration_id {
            Some(id) => id.to_string(),
            None => format!("draft:{}:{}", user_id, conference_id),
        }
    }
}

/// Hashed one-time phone code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhoneCodeRecord {
    pub phone: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}
