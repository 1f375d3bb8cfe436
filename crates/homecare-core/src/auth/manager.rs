//! Session manager: the single writer of the token store.
//!
//! Every session mutation goes through here. Reads and validity checks are
//! side-effect free; callers decide whether an invalid session gets cleared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{AuthTokens, Session, SessionPolicy, UserProfile};
use super::store::TokenStore;
use super::validator::{self, ValidationReason, ValidationResult};
use crate::api::{AuthBackend, AuthError, LoginGrant};
use crate::clock::{Clock, SystemClock};

pub struct SessionManager {
    store: Arc<dyn TokenStore>,
    backend: Arc<dyn AuthBackend>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    /// Bumped whenever a session is created or cleared. A refresh that sees
    /// a different epoch after its network call drops its result.
    epoch: AtomicU64,
    /// Held across every epoch change or check together with its store write.
    write_lock: std::sync::Mutex<()>,
    refresh_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn TokenStore>, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            store,
            backend,
            clock: Arc::new(SystemClock),
            policy: SessionPolicy::default(),
            epoch: AtomicU64::new(0),
            write_lock: std::sync::Mutex::new(()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Exchange credentials with the auth backend. Nothing is stored.
    pub async fn authenticate(&self, identifier: &str, password: &str) -> Result<LoginGrant, AuthError> {
        self.backend.login(identifier, password).await
    }

    /// Start a new session for `user` and persist it.
    pub fn create_session(
        &self,
        user: UserProfile,
        tokens: AuthTokens,
        remember_me: bool,
    ) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let session = Session {
            user,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            issued_at: now,
            expires_at: now + self.policy.ttl(remember_me),
            remember_me,
        };

        {
            let _writes = self.lock_writes();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.store.write(&session).map_err(AuthError::Storage)?;
        }
        info!(
            username = %session.user.username,
            remember_me,
            expires_at = %session.expires_at,
            "Session created"
        );
        Ok(session)
    }

    pub fn get_session(&self) -> Result<Option<Session>> {
        self.store.read()
    }

    /// Validate the stored session against the clock. An unreadable store
    /// counts as having no session.
    pub fn validate_session(&self) -> ValidationResult {
        match self.get_session() {
            Ok(session) => validator::validate(session.as_ref(), self.clock.now(), &self.policy),
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                ValidationResult::invalid(ValidationReason::NoSession)
            }
        }
    }

    pub fn should_refresh_session(&self) -> bool {
        match self.get_session() {
            Ok(Some(session)) => validator::should_refresh(&session, self.clock.now(), &self.policy),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                false
            }
        }
    }

    /// Renew the access token with the stored refresh token.
    ///
    /// On failure the stored session is left exactly as it was.
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh only if the stored session is inside its lead window.
    ///
    /// Concurrent callers are serialized; one that waited behind a
    /// successful refresh finds the session fresh again and returns `None`.
    pub async fn refresh_if_needed(&self) -> Result<Option<Session>, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        if !self.should_refresh_session() {
            return Ok(None);
        }
        self.refresh_locked().await.map(Some)
    }

    async fn refresh_locked(&self) -> Result<Session, AuthError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let current = self
            .get_session()
            .map_err(AuthError::Storage)?
            .ok_or_else(|| AuthError::RefreshFailed("no session to refresh".to_string()))?;

        let access_token = match self.backend.refresh(&current.refresh_token).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, username = %current.user.username, "Session refresh failed");
                return Err(e);
            }
        };

        let refreshed = {
            let _writes = self.lock_writes();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Session replaced or cleared during refresh, discarding new token");
                return Err(AuthError::RefreshFailed(
                    "session changed while refreshing".to_string(),
                ));
            }

            let now = self.clock.now();
            let refreshed = Session {
                access_token,
                expires_at: now + self.policy.ttl(current.remember_me),
                ..current
            };
            self.store.write(&refreshed).map_err(AuthError::Storage)?;
            refreshed
        };
        debug!(expires_at = %refreshed.expires_at, "Session refreshed");
        Ok(refreshed)
    }

    pub fn clear_session(&self) -> Result<(), AuthError> {
        {
            let _writes = self.lock_writes();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.store.clear().map_err(AuthError::Storage)?;
        }
        debug!("Session cleared");
        Ok(())
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
