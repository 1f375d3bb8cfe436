use futures::future::BoxFuture;

use super::AuthError;
use crate::auth::{AuthTokens, UserProfile};

/// Successful login as reported by the auth backend.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub user: UserProfile,
    pub tokens: AuthTokens,
}

/// The external service that issues and renews tokens.
pub trait AuthBackend: Send + Sync {
    fn login<'a>(
        &'a self,
        identifier: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<LoginGrant, AuthError>>;

    /// Exchange a refresh token for a new access token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<String, AuthError>>;
}
