//! Pure session validity checks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::session::{Session, SessionPolicy};

/// Why a session failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ValidationReason {
    None,
    SessionExpired,
    RememberMeExpired,
    NoSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ValidationResult {
    pub is_valid: bool,
    pub reason: ValidationReason,
}

impl ValidationResult {
    pub const VALID: Self = Self {
        is_valid: true,
        reason: ValidationReason::None,
    };

    pub fn invalid(reason: ValidationReason) -> Self {
        Self {
            is_valid: false,
            reason,
        }
    }
}

/// Check a stored session against the clock.
///
/// The remember-me horizon is checked before the access token expiry, so a
/// remembered session past its horizon always reports `RememberMeExpired`.
pub fn validate(
    session: Option<&Session>,
    now: DateTime<Utc>,
    policy: &SessionPolicy,
) -> ValidationResult {
    let Some(session) = session else {
        return ValidationResult::invalid(ValidationReason::NoSession);
    };

    if session.remember_me && now > session.remember_me_deadline(policy) {
        return ValidationResult::invalid(ValidationReason::RememberMeExpired);
    }

    if now > session.expires_at {
        return ValidationResult::invalid(ValidationReason::SessionExpired);
    }

    ValidationResult::VALID
}

/// True while `now` sits inside the lead window that ends at `expires_at`.
pub fn should_refresh(session: &Session, now: DateTime<Utc>, policy: &SessionPolicy) -> bool {
    let refresh_at = session.expires_at - policy.refresh_lead;
    now >= refresh_at && now <= session.expires_at
}
