//! Authentication module for managing user sessions and tokens.
//!
//! This module provides:
//! - `Session`: persisted token pair, user profile and expiry metadata
//! - `validator`: pure validity and refresh-window checks
//! - `TokenStore`: durable session storage (memory, file, sealed file, keychain)
//! - `SessionManager`: the only writer of the token store
//! - `AuthProvider`: reactive auth state with timers and host event re-checks
//!
//! Normal sessions last 30 minutes; remembered logins last 7 days per token
//! and at most 30 days in total.

pub mod keychain;
pub mod manager;
pub mod provider;
pub mod session;
pub mod store;
pub mod validator;

pub use keychain::KeyringTokenStore;
pub use manager::SessionManager;
pub use provider::{
    AuthPhase, AuthProvider, AuthSnapshot, CheckTrigger, HostEvent, Mount, Navigator,
    ProviderOptions, Route, Visibility,
};
pub use session::{AuthTokens, Session, SessionPolicy, UserProfile};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use validator::{ValidationReason, ValidationResult};
