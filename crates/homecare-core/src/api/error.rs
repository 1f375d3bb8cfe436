use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    #[error("Remembered login expired")]
    RememberMeExpired,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session storage error: {0}")]
    Storage(anyhow::Error),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Failure body shape shared by the backend and its proxy routes.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the human-readable message out of an `{ "error": ... }` body,
    /// falling back to the raw (truncated) text.
    fn message_from_body(body: &str) -> String {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self::truncate_body(&parsed.error),
            Err(_) => Self::truncate_body(body),
        }
    }

    /// Map a failed login response.
    pub fn from_login_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 | 401 | 403 => AuthError::InvalidCredentials,
            _ => Self::from_status(status, body),
        }
    }

    /// Map a failed refresh response.
    pub fn from_refresh_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 | 401 | 403 => AuthError::RefreshFailed(Self::message_from_body(body)),
            _ => Self::from_status(status, body),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::message_from_body(body);
        match status.as_u16() {
            429 => AuthError::RateLimited,
            500..=599 => AuthError::Server(message),
            _ => AuthError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Message suitable for showing to the person at the keyboard.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Invalid username or password".to_string(),
            AuthError::SessionExpired => "Your session has expired. Please log in again.".to_string(),
            AuthError::RememberMeExpired => {
                "Your saved login has expired. Please log in again.".to_string()
            }
            AuthError::RefreshFailed(_) => {
                "Could not renew your session. You may need to log in again soon.".to_string()
            }
            AuthError::RateLimited => "Too many attempts. Please wait and try again.".to_string(),
            AuthError::Network(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::Network(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Server(_) | AuthError::InvalidResponse(_) => {
                "The server could not complete the request. Please try again later.".to_string()
            }
            AuthError::Storage(_) => "Could not save your session on this device.".to_string(),
        }
    }
}
