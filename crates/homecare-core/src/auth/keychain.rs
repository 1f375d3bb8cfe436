use anyhow::{bail, Context, Result};
use keyring::Entry;

use super::session::Session;
use super::store::TokenStore;

const SERVICE_NAME: &str = "homecare";

/// Account name used when the caller doesn't pick one.
pub const DEFAULT_ACCOUNT: &str = "session";

/// Without a platform backend keyring falls back to a per-entry mock that
/// forgets everything once the entry is dropped.
const NATIVE_KEYCHAIN: bool = cfg!(feature = "keychain-native");

/// Session stored as a single JSON secret in the OS keychain.
pub struct KeyringTokenStore {
    entry: Entry,
}

impl KeyringTokenStore {
    pub fn new(account: &str) -> Result<Self> {
        Self::open(account, NATIVE_KEYCHAIN)
    }

    fn open(account: &str, native: bool) -> Result<Self> {
        if !native {
            bail!("Keychain token storage needs homecare built with the `keychain-native` feature");
        }
        let entry = Entry::new(SERVICE_NAME, account)
            .context("Failed to create keyring entry")?;
        Ok(Self { entry })
    }

    /// Store backed by keyring's in-process mock credentials.
    #[cfg(test)]
    pub(crate) fn mock(account: &str) -> Result<Self> {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        Self::open(account, true)
    }
}

impl TokenStore for KeyringTokenStore {
    fn write(&self, session: &Session) -> Result<()> {
        let secret = serde_json::to_string(session).context("Failed to serialize session")?;
        self.entry
            .set_password(&secret)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn read(&self) -> Result<Option<Session>> {
        match self.entry.get_password() {
            Ok(secret) => {
                let session = serde_json::from_str(&secret)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn clear(&self) -> Result<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}
