//! Client side of the external auth service.
//!
//! `AuthBackend` is the seam the session manager talks through;
//! `HttpAuthBackend` is the production implementation over the backend's
//! `/auth/login` and `/auth/refresh` endpoints.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{AuthBackend, LoginGrant};
pub use client::HttpAuthBackend;
pub use error::AuthError;
