//! Reactive auth state for the UI.
//!
//! `AuthProvider` is a cheap-to-clone handle around one shared state cell.
//! It re-validates the stored session on startup, when the user navigates to
//! a protected route while logged out, on a fixed interval while logged in,
//! and when the page comes back into view. Consumers watch `AuthSnapshot`
//! through a `tokio::sync::watch` channel.
//!
//! `mount()` starts the background task that owns the timer and host event
//! subscription; `Mount::teardown()` (or dropping the handle) stops it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::manager::SessionManager;
use super::session::{AuthTokens, UserProfile};
use super::validator::ValidationReason;
use crate::api::AuthError;

// ============================================================================
// Constants
// ============================================================================

/// How often a logged-in session is re-validated in the background.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Route of the login page.
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Buffer size for the host event channel.
/// Events are tiny and handled quickly; 32 absorbs bursts of navigation.
const EVENT_BUFFER_SIZE: usize = 32;

// ============================================================================
// State Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthPhase {
    Uninitialized,
    Loading,
    Authenticated,
    Unauthenticated,
}

/// What the UI renders from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthSnapshot {
    pub phase: AuthPhase,
    pub user: Option<UserProfile>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    /// One-time message after the session ended on its own.
    pub notice: Option<String>,
}

impl AuthSnapshot {
    fn uninitialized() -> Self {
        Self {
            phase: AuthPhase::Uninitialized,
            user: None,
            is_authenticated: false,
            is_loading: true,
            notice: None,
        }
    }

    fn loading() -> Self {
        Self {
            phase: AuthPhase::Loading,
            ..Self::uninitialized()
        }
    }

    fn authenticated(user: UserProfile) -> Self {
        Self {
            phase: AuthPhase::Authenticated,
            user: Some(user),
            is_authenticated: true,
            is_loading: false,
            notice: None,
        }
    }

    fn unauthenticated(notice: Option<String>) -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            user: None,
            is_authenticated: false,
            is_loading: false,
            notice,
        }
    }
}

/// A location in the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(String);

impl Route {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// True for `prefix` itself and anything nested under it.
    fn is_under(&self, prefix: &Route) -> bool {
        let prefix = prefix.0.trim_end_matches('/');
        self.0 == prefix
            || self
                .0
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Notifications from the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    RouteChanged(Route),
    VisibilityChanged(Visibility),
}

/// What caused a re-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    Initial,
    RouteChange,
    Periodic,
    Visibility,
}

/// Host hook for sending the user to the login page.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self, login: &Route);
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub login_route: Route,
    /// Routes (and everything under them) that don't need a session.
    pub public_routes: Vec<Route>,
    pub recheck_interval: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            login_route: Route::new(DEFAULT_LOGIN_PATH),
            public_routes: Vec::new(),
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
        }
    }
}

impl ProviderOptions {
    pub fn requires_auth(&self, route: &Route) -> bool {
        !route.is_under(&self.login_route) && !self.public_routes.iter().any(|p| route.is_under(p))
    }
}

// ============================================================================
// Provider
// ============================================================================

struct ProviderInner {
    manager: Arc<SessionManager>,
    navigator: Arc<dyn Navigator>,
    options: ProviderOptions,
    state: watch::Sender<AuthSnapshot>,
    location: Mutex<Option<Route>>,
    visibility: Mutex<Visibility>,
    /// Serializes re-validation so overlapping triggers run one at a time.
    check_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct AuthProvider {
    inner: Arc<ProviderInner>,
}

impl AuthProvider {
    pub fn new(
        manager: Arc<SessionManager>,
        navigator: Arc<dyn Navigator>,
        options: ProviderOptions,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::uninitialized());
        Self {
            inner: Arc::new(ProviderInner {
                manager,
                navigator,
                options,
                state,
                location: Mutex::new(None),
                visibility: Mutex::new(Visibility::Visible),
                check_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.inner.manager
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> AuthPhase {
        self.inner.state.borrow().phase
    }

    pub fn location(&self) -> Option<Route> {
        self.inner
            .location
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record where the host currently is without triggering a re-check.
    pub fn set_location(&self, route: Route) {
        *self.inner.location.lock().unwrap_or_else(|e| e.into_inner()) = Some(route);
    }

    /// First validation after startup. Only the first call does anything.
    pub async fn initialize(&self) {
        let _guard = self.inner.check_lock.lock().await;
        if self.phase() != AuthPhase::Uninitialized {
            debug!("Auth provider already initialized");
            return;
        }
        self.inner.state.send_replace(AuthSnapshot::loading());
        self.check_locked(CheckTrigger::Initial).await;
    }

    /// Re-validate the stored session now.
    pub async fn recheck(&self, trigger: CheckTrigger) {
        let _guard = self.inner.check_lock.lock().await;
        self.check_locked(trigger).await;
    }

    async fn check_locked(&self, trigger: CheckTrigger) {
        let manager = &self.inner.manager;
        let result = manager.validate_session();
        debug!(?trigger, valid = result.is_valid, reason = ?result.reason, "Session checked");

        if !result.is_valid {
            self.end_session(result.reason, trigger);
            return;
        }

        let user = match manager.get_session() {
            Ok(Some(session)) => session.user,
            Ok(None) => {
                self.end_session(ValidationReason::NoSession, trigger);
                return;
            }
            Err(e) => {
                warn!(error = %e, "Stored session disappeared after validation");
                self.end_session(ValidationReason::NoSession, trigger);
                return;
            }
        };
        if self.snapshot().user.as_ref() != Some(&user) {
            self.transition(AuthSnapshot::authenticated(user), trigger);
        }

        // Soft failure: the session stays and the next check retries.
        match manager.refresh_if_needed().await {
            Ok(Some(_)) => info!("Session refreshed"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Silent session refresh failed, will retry on next check"),
        }
    }

    fn end_session(&self, reason: ValidationReason, trigger: CheckTrigger) {
        if let Err(e) = self.inner.manager.clear_session() {
            warn!(error = %e, "Failed to clear invalid session");
        }
        let notice = match reason {
            ValidationReason::SessionExpired => Some(AuthError::SessionExpired.user_message()),
            ValidationReason::RememberMeExpired => Some(AuthError::RememberMeExpired.user_message()),
            ValidationReason::NoSession | ValidationReason::None => None,
        };
        if self.phase() == AuthPhase::Unauthenticated && notice.is_none() {
            // Nothing new to tell the UI; still honor a navigation to a protected page.
            if trigger == CheckTrigger::RouteChange {
                self.redirect_if_needed(AuthPhase::Unauthenticated, trigger);
            }
            return;
        }
        self.transition(AuthSnapshot::unauthenticated(notice), trigger);
    }

    fn transition(&self, next: AuthSnapshot, trigger: CheckTrigger) {
        let next_phase = next.phase;
        let previous = self.inner.state.send_replace(next);
        if previous.phase != next_phase {
            info!(from = ?previous.phase, to = ?next_phase, ?trigger, "Auth state changed");
        }
        if next_phase == AuthPhase::Unauthenticated {
            self.redirect_if_needed(previous.phase, trigger);
        }
    }

    /// Send the user to login unless they're already there, on a public
    /// page, or were already logged out (except when they just navigated
    /// to a protected page).
    fn redirect_if_needed(&self, previous: AuthPhase, trigger: CheckTrigger) {
        if previous == AuthPhase::Unauthenticated && trigger != CheckTrigger::RouteChange {
            return;
        }
        let options = &self.inner.options;
        if let Some(location) = self.location() {
            if !options.requires_auth(&location) {
                return;
            }
        }
        debug!(login = %options.login_route, "Redirecting to login");
        self.inner.navigator.redirect_to_login(&options.login_route);
        self.set_location(options.login_route.clone());
    }

    /// Adopt a session the auth backend just issued.
    ///
    /// The UI sees the new user immediately; the session is persisted after.
    pub fn login(
        &self,
        user: UserProfile,
        tokens: AuthTokens,
        remember_me: bool,
    ) -> Result<(), AuthError> {
        self.inner
            .state
            .send_replace(AuthSnapshot::authenticated(user.clone()));

        match self.inner.manager.create_session(user, tokens, remember_me) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Failed to persist new session");
                self.transition(AuthSnapshot::unauthenticated(None), CheckTrigger::Initial);
                Err(e)
            }
        }
    }

    /// Log in with credentials. On failure nothing changes.
    pub async fn sign_in(
        &self,
        identifier: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<UserProfile, AuthError> {
        let grant = self.inner.manager.authenticate(identifier, password).await?;
        let user = grant.user.clone();
        self.login(grant.user, grant.tokens, remember_me)?;
        Ok(user)
    }

    pub fn logout(&self) {
        let previous = self
            .inner
            .state
            .send_replace(AuthSnapshot::unauthenticated(None));
        if let Err(e) = self.inner.manager.clear_session() {
            warn!(error = %e, "Failed to clear session on logout");
        }
        info!(from = ?previous.phase, "Logged out");

        let login = &self.inner.options.login_route;
        let on_login = self.location().map(|r| r.is_under(login)).unwrap_or(false);
        if !on_login {
            self.inner.navigator.redirect_to_login(login);
            self.set_location(login.clone());
        }
    }

    pub async fn handle_event(&self, event: HostEvent) {
        if let Some(trigger) = self.apply_event(event) {
            self.recheck(trigger).await;
        }
    }

    /// Record what the host reported and say whether it calls for a re-check.
    fn apply_event(&self, event: HostEvent) -> Option<CheckTrigger> {
        match event {
            HostEvent::RouteChanged(route) => {
                let protected = self.inner.options.requires_auth(&route);
                self.set_location(route);
                (protected && self.phase() == AuthPhase::Unauthenticated)
                    .then_some(CheckTrigger::RouteChange)
            }
            HostEvent::VisibilityChanged(next) => {
                let previous = {
                    let mut visibility = self
                        .inner
                        .visibility
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    std::mem::replace(&mut *visibility, next)
                };
                let snapshot = self.snapshot();
                (previous == Visibility::Hidden
                    && next == Visibility::Visible
                    && !snapshot.is_loading
                    && snapshot.phase == AuthPhase::Authenticated)
                    .then_some(CheckTrigger::Visibility)
            }
        }
    }

    /// Start the background task: initial validation, the periodic timer,
    /// and the host event loop.
    ///
    /// Checks run as child tasks so a slow refresh never holds up host
    /// events or teardown; the children are aborted when the loop exits.
    pub fn mount(&self) -> Mount {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let provider = self.clone();

        let task = tokio::spawn(async move {
            let mut checks = JoinSet::new();
            {
                let provider = provider.clone();
                checks.spawn(async move { provider.initialize().await });
            }

            let period = provider.inner.options.recheck_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        // A check still in flight covers this tick.
                        if checks.is_empty() && provider.phase() == AuthPhase::Authenticated {
                            let provider = provider.clone();
                            checks.spawn(async move { provider.recheck(CheckTrigger::Periodic).await });
                        }
                    }
                    event = events_rx.recv() => match event {
                        Some(event) => {
                            if let Some(trigger) = provider.apply_event(event) {
                                let provider = provider.clone();
                                checks.spawn(async move { provider.recheck(trigger).await });
                            }
                        }
                        None => break,
                    },
                    Some(finished) = checks.join_next(), if !checks.is_empty() => {
                        if let Err(e) = finished {
                            if !e.is_cancelled() {
                                warn!(error = %e, "Auth check ended abnormally");
                            }
                        }
                    }
                }
            }

            checks.shutdown().await;
            debug!("Auth provider task stopped");
        });

        Mount {
            events: events_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a mounted provider. Dropping it stops the background task.
pub struct Mount {
    events: mpsc::Sender<HostEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Mount {
    pub fn events(&self) -> mpsc::Sender<HostEvent> {
        self.events.clone()
    }

    pub async fn send(&self, event: HostEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Auth provider is not running"))
    }

    /// Stop the timer and event loop and wait for the task to finish.
    pub async fn teardown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Auth provider task ended abnormally");
                }
            }
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::backend::stub::StubBackend;
    use crate::auth::session::{fixtures, Session};
    use crate::auth::store::{MemoryTokenStore, TokenStore};
    use crate::clock::{Clock, ManualClock};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingNavigator {
        redirects: Mutex<Vec<String>>,
    }

    impl RecordingNavigator {
        fn count(&self) -> usize {
            self.redirects.lock().unwrap().len()
        }
    }

    impl Navigator for RecordingNavigator {
        fn redirect_to_login(&self, login: &Route) {
            self.redirects.lock().unwrap().push(login.path().to_string());
        }
    }

    struct Harness {
        provider: AuthProvider,
        navigator: Arc<RecordingNavigator>,
        backend: Arc<StubBackend>,
        store: Arc<MemoryTokenStore>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        harness_with(StubBackend::new())
    }

    fn harness_with(backend: StubBackend) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryTokenStore::new());
        let clock = ManualClock::new(Utc::now());
        let manager = SessionManager::new(store.clone(), backend.clone())
            .with_clock(Arc::new(clock.clone()));
        let navigator = Arc::new(RecordingNavigator::default());
        let options = ProviderOptions {
            public_routes: vec![Route::new("/about")],
            ..ProviderOptions::default()
        };
        let provider = AuthProvider::new(Arc::new(manager), navigator.clone(), options);
        provider.set_location(Route::new("/appointments"));
        Harness {
            provider,
            navigator,
            backend,
            store,
            clock,
        }
    }

    fn seed_session(h: &Harness, remember_me: bool) {
        h.provider
            .manager()
            .create_session(fixtures::profile(), fixtures::tokens(), remember_me)
            .unwrap();
    }

    #[test]
    fn test_route_matching() {
        let options = ProviderOptions {
            public_routes: vec![Route::new("/about/")],
            ..ProviderOptions::default()
        };
        assert!(!options.requires_auth(&Route::new("/login")));
        assert!(!options.requires_auth(&Route::new("/about")));
        assert!(!options.requires_auth(&Route::new("/about/team")));
        assert!(options.requires_auth(&Route::new("/aboutus")));
        assert!(options.requires_auth(&Route::new("/patients/7")));
    }

    #[test]
    fn test_starts_uninitialized_and_loading() {
        let h = harness();
        let snapshot = h.provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Uninitialized);
        assert!(snapshot.is_loading);
        assert!(!snapshot.is_authenticated);
    }

    #[tokio::test]
    async fn test_initialize_with_valid_session() {
        let h = harness();
        seed_session(&h, false);

        h.provider.initialize().await;
        let snapshot = h.provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Authenticated);
        assert!(snapshot.is_authenticated);
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.user, Some(fixtures::profile()));
        assert_eq!(h.navigator.count(), 0);
        assert_eq!(h.backend.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let h = harness();
        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);

        seed_session(&h, false);
        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_without_session_redirects_once() {
        let h = harness();
        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.navigator.count(), 1);
        assert_eq!(h.provider.location(), Some(Route::new("/login")));
    }

    #[tokio::test]
    async fn test_initialize_on_login_page_does_not_redirect() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_on_public_page_does_not_redirect() {
        let h = harness();
        h.provider.set_location(Route::new("/about"));
        h.provider.initialize().await;
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_with_expired_session_clears_it() {
        let h = harness();
        seed_session(&h, false);
        h.clock.advance(ChronoDuration::minutes(45));

        h.provider.initialize().await;
        let snapshot = h.provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Unauthenticated);
        assert_eq!(
            snapshot.notice,
            Some(AuthError::SessionExpired.user_message())
        );
        assert!(h.store.read().unwrap().is_none());
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_inside_lead_window_refreshes_silently() {
        let h = harness();
        seed_session(&h, false);
        h.clock.advance(ChronoDuration::minutes(27));

        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);
        assert_eq!(h.backend.refreshes(), 1);
        let stored = h.store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "access-2");
        assert!(!h.provider.manager().should_refresh_session());
    }

    #[tokio::test]
    async fn test_failed_silent_refresh_keeps_user_logged_in() {
        let h = harness();
        seed_session(&h, false);
        h.backend.fail_refresh.store(true, Ordering::SeqCst);
        h.clock.advance(ChronoDuration::minutes(27));

        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);
        assert_eq!(h.store.read().unwrap().unwrap().access_token, "access-1");

        // Next scheduled check tries again
        h.backend.fail_refresh.store(false, Ordering::SeqCst);
        h.provider.recheck(CheckTrigger::Periodic).await;
        assert_eq!(h.backend.refreshes(), 2);
        assert_eq!(h.store.read().unwrap().unwrap().access_token, "access-3");
    }

    #[tokio::test]
    async fn test_route_change_picks_up_session_from_elsewhere() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);

        // Another window logged in against the same store
        seed_session(&h, false);
        h.provider
            .handle_event(HostEvent::RouteChanged(Route::new("/payments")))
            .await;
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_route_change_to_protected_page_while_logged_out_redirects() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;

        h.provider
            .handle_event(HostEvent::RouteChanged(Route::new("/health-records")))
            .await;
        assert_eq!(h.navigator.count(), 1);

        // Landing on login or a public page never redirects
        h.provider
            .handle_event(HostEvent::RouteChanged(Route::new("/login")))
            .await;
        h.provider
            .handle_event(HostEvent::RouteChanged(Route::new("/about")))
            .await;
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_visibility_recheck_catches_background_expiry() {
        let h = harness();
        seed_session(&h, false);
        h.provider.initialize().await;

        h.provider
            .handle_event(HostEvent::VisibilityChanged(Visibility::Hidden))
            .await;
        h.clock.advance(ChronoDuration::hours(2));
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);

        h.provider
            .handle_event(HostEvent::VisibilityChanged(Visibility::Visible))
            .await;
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_visible_without_hidden_does_not_recheck() {
        let h = harness();
        seed_session(&h, false);
        h.provider.initialize().await;
        h.clock.advance(ChronoDuration::hours(2));

        h.provider
            .handle_event(HostEvent::VisibilityChanged(Visibility::Visible))
            .await;
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_remember_me_horizon_ends_session() {
        let h = harness();
        seed_session(&h, true);
        h.provider.initialize().await;

        let horizon = h.provider.manager().policy().remember_me_horizon;
        h.clock.advance(horizon + ChronoDuration::minutes(1));
        h.provider.recheck(CheckTrigger::Periodic).await;

        let snapshot = h.provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Unauthenticated);
        assert_eq!(
            snapshot.notice,
            Some(AuthError::RememberMeExpired.user_message())
        );
    }

    #[tokio::test]
    async fn test_repeated_checks_while_logged_out_do_not_loop() {
        let h = harness();
        h.provider.initialize().await;
        h.provider.recheck(CheckTrigger::Periodic).await;
        h.provider.recheck(CheckTrigger::Visibility).await;
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_login_updates_state_and_persists() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;
        let mut rx = h.provider.subscribe();

        h.provider
            .login(fixtures::profile(), fixtures::tokens(), true)
            .unwrap();
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.is_authenticated);
        assert_eq!(snapshot.user.unwrap().username, "nurse.jackie");

        let stored = h.store.read().unwrap().unwrap();
        assert!(stored.remember_me);
        assert_eq!(stored.issued_at, h.clock.now());
    }

    /// Store that can't persist anything.
    struct FullDiskStore;

    impl TokenStore for FullDiskStore {
        fn write(&self, _session: &Session) -> anyhow::Result<()> {
            anyhow::bail!("no space left on device")
        }

        fn read(&self) -> anyhow::Result<Option<Session>> {
            Ok(None)
        }

        fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_login_rolls_back_when_session_cannot_be_stored() {
        let backend = Arc::new(StubBackend::new());
        let manager = SessionManager::new(Arc::new(FullDiskStore), backend);
        let navigator = Arc::new(RecordingNavigator::default());
        let provider =
            AuthProvider::new(Arc::new(manager), navigator.clone(), ProviderOptions::default());
        provider.set_location(Route::new("/appointments"));

        let err = provider
            .login(fixtures::profile(), fixtures::tokens(), false)
            .unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));

        let snapshot = provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Unauthenticated);
        assert!(!snapshot.is_authenticated);
        assert!(snapshot.user.is_none());
        assert_eq!(navigator.count(), 1);
        assert_eq!(provider.location(), Some(Route::new("/login")));

        // Same outcome through the credential flow
        let err = provider.sign_in("jackie", "pw", false).await.unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));
        assert_eq!(provider.phase(), AuthPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_sign_in_rejected_changes_nothing() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;
        h.backend.reject_login.store(true, Ordering::SeqCst);

        let err = h.provider.sign_in("jackie", "nope", false).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(h.provider.phase(), AuthPhase::Unauthenticated);
        assert!(h.store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_then_logout() {
        let h = harness();
        h.provider.set_location(Route::new("/login"));
        h.provider.initialize().await;

        let user = h.provider.sign_in("jackie", "pw", false).await.unwrap();
        assert_eq!(user, fixtures::profile());
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);

        h.provider.set_location(Route::new("/families"));
        h.provider.logout();
        let snapshot = h.provider.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Unauthenticated);
        assert!(snapshot.user.is_none());
        assert!(h.store.read().unwrap().is_none());
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mounted_provider_rechecks_periodically() {
        let h = harness();
        seed_session(&h, false);
        let mut rx = h.provider.subscribe();
        let mount = h.provider.mount();

        rx.wait_for(|s| s.phase == AuthPhase::Authenticated)
            .await
            .unwrap();

        // Wall clock jumps past expiry; the next tick notices.
        h.clock.advance(ChronoDuration::hours(1));
        tokio::time::timeout(
            DEFAULT_RECHECK_INTERVAL * 2,
            rx.wait_for(|s| s.phase == AuthPhase::Unauthenticated),
        )
        .await
        .expect("periodic check should run")
        .unwrap();

        assert_eq!(h.navigator.count(), 1);
        mount.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mounted_provider_handles_host_events() {
        let h = harness();
        seed_session(&h, false);
        let mut rx = h.provider.subscribe();
        let mount = h.provider.mount();
        rx.wait_for(|s| s.phase == AuthPhase::Authenticated)
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::hours(1));
        mount
            .send(HostEvent::VisibilityChanged(Visibility::Hidden))
            .await
            .unwrap();
        mount
            .send(HostEvent::VisibilityChanged(Visibility::Visible))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| s.phase == AuthPhase::Unauthenticated),
        )
        .await
        .expect("visibility check should run")
        .unwrap();
        mount.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_periodic_checks() {
        let h = harness();
        seed_session(&h, false);
        let mut rx = h.provider.subscribe();
        let mount = h.provider.mount();
        rx.wait_for(|s| s.phase == AuthPhase::Authenticated)
            .await
            .unwrap();

        let events = mount.events();
        mount.teardown().await;
        assert!(events.send(HostEvent::VisibilityChanged(Visibility::Hidden)).await.is_err());

        h.clock.advance(ChronoDuration::hours(1));
        tokio::time::sleep(DEFAULT_RECHECK_INTERVAL * 3).await;
        assert_eq!(h.provider.phase(), AuthPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_abandons_stalled_refresh() {
        let (backend, _gate) = StubBackend::gated();
        let h = harness_with(backend);
        seed_session(&h, false);
        h.clock.advance(ChronoDuration::minutes(27));
        let mut rx = h.provider.subscribe();
        let mount = h.provider.mount();

        rx.wait_for(|s| s.phase == AuthPhase::Authenticated)
            .await
            .unwrap();
        while h.backend.refreshes() == 0 {
            tokio::task::yield_now().await;
        }

        // Host events still get through while the refresh hangs
        mount
            .send(HostEvent::RouteChanged(Route::new("/payments")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.provider.location(), Some(Route::new("/payments")));

        tokio::time::timeout(Duration::from_secs(5), mount.teardown())
            .await
            .expect("teardown should not wait for the refresh");
        assert_eq!(h.store.read().unwrap().unwrap().access_token, "access-1");
        assert_eq!(h.backend.refreshes(), 1);
    }
}
