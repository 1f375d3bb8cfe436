use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access token lifetime for a normal login.
/// Matches the backend's idle timeout for access tokens.
pub const SESSION_TTL_MINUTES: i64 = 30;

/// Access token lifetime when the user asked to be remembered.
pub const REMEMBER_ME_TTL_MINUTES: i64 = 7 * 24 * 60;

/// Absolute cap on a remembered login, measured from when it was issued.
/// Refreshes never extend a session past this point.
pub const REMEMBER_ME_HORIZON_MINUTES: i64 = 30 * 24 * 60;

/// Buffer time before expiry to trigger refresh (5 minutes)
pub const REFRESH_LEAD_MINUTES: i64 = 5;

/// Profile of the logged-in user as returned by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Token pair issued by the auth backend on login.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Persisted authentication state. Only the session manager creates or
/// mutates these.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user.username)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("remember_me", &self.remember_me)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes().max(0)
    }

    /// The point after which a remembered login must be re-entered.
    pub fn remember_me_deadline(&self, policy: &SessionPolicy) -> DateTime<Utc> {
        self.issued_at + policy.remember_me_horizon
    }
}

/// Lifetimes applied to new and refreshed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub session_ttl: Duration,
    pub remember_me_ttl: Duration,
    pub remember_me_horizon: Duration,
    pub refresh_lead: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_ttl: Duration::minutes(SESSION_TTL_MINUTES),
            remember_me_ttl: Duration::minutes(REMEMBER_ME_TTL_MINUTES),
            remember_me_horizon: Duration::minutes(REMEMBER_ME_HORIZON_MINUTES),
            refresh_lead: Duration::minutes(REFRESH_LEAD_MINUTES),
        }
    }
}

impl SessionPolicy {
    /// Build a policy, rejecting combinations that break the session invariants.
    pub fn new(
        session_ttl: Duration,
        remember_me_ttl: Duration,
        remember_me_horizon: Duration,
        refresh_lead: Duration,
    ) -> anyhow::Result<Self> {
        if session_ttl <= Duration::zero() {
            anyhow::bail!("session TTL must be positive");
        }
        if remember_me_ttl <= session_ttl {
            anyhow::bail!("remember-me TTL must be longer than the session TTL");
        }
        if remember_me_horizon < remember_me_ttl {
            anyhow::bail!("remember-me horizon must not be shorter than the remember-me TTL");
        }
        if refresh_lead < Duration::zero() || refresh_lead >= session_ttl {
            anyhow::bail!("refresh lead must be shorter than the session TTL");
        }
        Ok(Self {
            session_ttl,
            remember_me_ttl,
            remember_me_horizon,
            refresh_lead,
        })
    }

    pub fn from_minutes(
        session_ttl: i64,
        remember_me_ttl: i64,
        remember_me_horizon: i64,
        refresh_lead: i64,
    ) -> anyhow::Result<Self> {
        Self::new(
            Duration::minutes(session_ttl),
            Duration::minutes(remember_me_ttl),
            Duration::minutes(remember_me_horizon),
            Duration::minutes(refresh_lead),
        )
    }

    pub fn ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.remember_me_ttl
        } else {
            self.session_ttl
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn profile() -> UserProfile {
        UserProfile {
            id: "42".to_string(),
            username: "nurse.jackie".to_string(),
            display_name: "Jackie Peyton".to_string(),
            role: "caregiver".to_string(),
            status: "active".to_string(),
            created_at: DateTime::parse_from_rfc3339("2024-03-01T09:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        }
    }

    pub fn tokens() -> AuthTokens {
        AuthTokens {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
        }
    }

    pub fn session_at(issued_at: DateTime<Utc>, remember_me: bool) -> Session {
        let policy = SessionPolicy::default();
        Session {
            user: profile(),
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            issued_at,
            expires_at: issued_at + policy.ttl(remember_me),
            remember_me,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_keeps_invariants() {
        let policy = SessionPolicy::default();
        assert!(policy.ttl(true) > policy.ttl(false));
        assert!(policy.remember_me_horizon >= policy.remember_me_ttl);
        assert!(policy.refresh_lead < policy.session_ttl);
    }

    #[test]
    fn test_policy_rejects_short_remember_me() {
        assert!(SessionPolicy::from_minutes(30, 30, 60, 5).is_err());
        assert!(SessionPolicy::from_minutes(30, 20, 60, 5).is_err());
        assert!(SessionPolicy::from_minutes(30, 60, 45, 5).is_err());
        assert!(SessionPolicy::from_minutes(30, 60, 120, 30).is_err());
        assert!(SessionPolicy::from_minutes(0, 60, 120, 0).is_err());
        assert!(SessionPolicy::from_minutes(30, 60, 120, 5).is_ok());
    }

    #[test]
    fn test_minutes_until_expiry_never_negative() {
        let now = Utc::now();
        let session = fixtures::session_at(now, false);
        assert_eq!(session.minutes_until_expiry(now), SESSION_TTL_MINUTES);
        assert_eq!(session.minutes_until_expiry(now + Duration::hours(2)), 0);
    }

    #[test]
    fn test_debug_output_redacts_tokens() {
        let session = fixtures::session_at(Utc::now(), true);
        let printed = format!("{:?} {:?}", session, fixtures::tokens());
        assert!(!printed.contains("access-1"));
        assert!(!printed.contains("refresh-1"));
        assert!(printed.contains("nurse.jackie"));
    }
}
