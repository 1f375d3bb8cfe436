//! Core library for the homecare client.
//!
//! This crate owns the client-side authentication lifecycle:
//!
//! - `auth`: sessions, validation, token storage, the session manager and the
//!   reactive auth provider
//! - `api`: the external auth collaborator and its HTTP implementation
//! - `clock`: injectable time source
//! - `config`: on-disk application configuration

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;

pub use api::{AuthBackend, AuthError, HttpAuthBackend};
pub use auth::{
    AuthPhase, AuthProvider, AuthSnapshot, AuthTokens, HostEvent, Mount, Navigator, Route,
    Session, SessionManager, SessionPolicy, TokenStore, UserProfile, ValidationReason,
    ValidationResult, Visibility,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
