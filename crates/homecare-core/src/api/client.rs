//! HTTP implementation of the auth backend.
//!
//! The backend speaks camelCase JSON; responses are renamed into the
//! crate's snake_case domain types here and nowhere else.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::{AuthBackend, LoginGrant};
use super::AuthError;
use crate::auth::{AuthTokens, UserProfile};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// User ids come back as numbers from some deployments and strings from others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: WireId,
    username: String,
    #[serde(default, alias = "displayName")]
    name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

impl WireUser {
    fn into_profile(self) -> UserProfile {
        let id = match self.id {
            WireId::Number(n) => n.to_string(),
            WireId::Text(s) => s,
        };
        let display_name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.username.clone());

        UserProfile {
            id,
            username: self.username,
            display_name,
            role: self.role.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            created_at: self.created_at,
        }
    }
}

/// Auth backend client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
    initial_backoff: Duration,
}

impl HttpAuthBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff delay.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body, retrying with exponential backoff while the server
    /// answers 429. Any other status is returned to the caller.
    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response, AuthError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .client
                .post(url)
                .header(header::ACCEPT, "application/json")
                .json(body)
                .send()
                .await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(AuthError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    async fn authenticate(&self, identifier: &str, password: &str) -> Result<LoginGrant, AuthError> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self.post(&url, &LoginRequest { identifier, password }).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_login_status(status, &body));
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        debug!(username = %parsed.user.username, "Login accepted");
        Ok(LoginGrant {
            user: parsed.user.into_profile(),
            tokens: AuthTokens {
                access_token: parsed.access_token,
                refresh_token: parsed.refresh_token,
            },
        })
    }

    async fn renew(&self, refresh_token: &str) -> Result<String, AuthError> {
        let url = format!("{}/auth/refresh", self.base_url);
        let response = self.post(&url, &RefreshRequest { refresh_token }).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_refresh_status(status, &body));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;
        Ok(parsed.access_token)
    }
}

impl AuthBackend for HttpAuthBackend {
    fn login<'a>(
        &'a self,
        identifier: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<LoginGrant, AuthError>> {
        self.authenticate(identifier, password).boxed()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<String, AuthError>> {
        self.renew(refresh_token).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_login_renames_backend_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"identifier": "jackie", "password": "s3cret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "acc",
                "refreshToken": "ref",
                "user": {
                    "id": 17,
                    "username": "jackie",
                    "name": "Jackie Peyton",
                    "role": "caregiver",
                    "status": "active",
                    "createdAt": "2024-03-01T09:00:00Z"
                }
            })))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&format!("{}/", server.uri())).unwrap();
        let grant = backend.login("jackie", "s3cret").await.unwrap();

        assert_eq!(grant.tokens.access_token, "acc");
        assert_eq!(grant.tokens.refresh_token, "ref");
        assert_eq!(grant.user.id, "17");
        assert_eq!(grant.user.display_name, "Jackie Peyton");
        assert_eq!(grant.user.role, "caregiver");
        assert_eq!(grant.user.created_at.to_rfc3339(), "2024-03-01T09:00:00+00:00");
    }

    #[tokio::test]
    async fn test_login_display_name_falls_back_to_username() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "acc",
                "refreshToken": "ref",
                "user": {
                    "id": "u-9",
                    "username": "family.smith",
                    "createdAt": "2024-05-12T14:30:00Z"
                }
            })))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri()).unwrap();
        let grant = backend.login("family.smith", "pw").await.unwrap();
        assert_eq!(grant.user.id, "u-9");
        assert_eq!(grant.user.display_name, "family.smith");
    }

    #[tokio::test]
    async fn test_login_without_created_at_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "acc",
                "refreshToken": "ref",
                "user": { "id": 3, "username": "family.smith", "name": "Sam Smith" }
            })))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri()).unwrap();
        let err = backend.login("family.smith", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_login_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad password"})))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri()).unwrap();
        let err = backend.login("jackie", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_login_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri()).unwrap();
        let err = backend.login("jackie", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_success_and_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refreshToken": "good"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "fresh"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refreshToken": "revoked"})))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "revoked"})))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri()).unwrap();
        assert_eq!(backend.refresh("good").await.unwrap(), "fresh");
        match backend.refresh("revoked").await.unwrap_err() {
            AuthError::RefreshFailed(msg) => assert_eq!(msg, "revoked"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "later"})))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri())
            .unwrap()
            .with_initial_backoff(Duration::from_millis(5));
        assert_eq!(backend.refresh("r").await.unwrap(), "later");
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let backend = HttpAuthBackend::new(&server.uri())
            .unwrap()
            .with_initial_backoff(Duration::from_millis(1));
        let err = backend.login("a", "b").await.unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        // Grab a free port and release it so nothing is listening there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = HttpAuthBackend::new(&format!("http://127.0.0.1:{}", port)).unwrap();
        let err = backend.login("a", "b").await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
    }
}
