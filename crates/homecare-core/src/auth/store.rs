//! Durable storage for the current session.
//!
//! A store holds at most one session. Writes replace the previous session
//! as a whole: file-backed stores write a sibling temp file and rename it
//! over the target, so a reader never sees half a session.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::debug;

use super::session::Session;

/// Session file name in cache directory
pub const SESSION_FILE: &str = "session.json";

/// Sealed session file name in cache directory
pub const SEALED_SESSION_FILE: &str = "session.sealed";

/// Header identifying a sealed session file (format version 1).
const SEALED_MAGIC: &[u8; 4] = b"HCS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

pub trait TokenStore: Send + Sync {
    /// Persist `session`, replacing whatever was stored before.
    fn write(&self, session: &Session) -> Result<()>;

    /// The stored session, or `None` if nothing was written or it was cleared.
    fn read(&self) -> Result<Option<Session>>;

    /// Remove the stored session. Clearing an empty store is a no-op.
    fn clear(&self) -> Result<()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<Session>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn write(&self, session: &Session) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *slot = Some(session.clone());
        Ok(())
    }

    fn read(&self) -> Result<Option<Session>> {
        let slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        Ok(slot.clone())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}

/// Session persisted to a file in the cache directory, either as plain JSON
/// or sealed with a passphrase.
pub struct FileTokenStore {
    path: PathBuf,
    passphrase: Option<Vec<u8>>,
}

impl FileTokenStore {
    /// Plain JSON store at `<cache_dir>/session.json`.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(SESSION_FILE),
            passphrase: None,
        }
    }

    /// Encrypted store at `<cache_dir>/session.sealed`.
    ///
    /// The session JSON is sealed with ChaCha20-Poly1305 under a key derived
    /// from `passphrase` with Argon2. Each write uses a fresh salt and nonce.
    pub fn sealed(cache_dir: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            bail!("Sealed session store requires a non-empty passphrase");
        }
        Ok(Self {
            path: cache_dir.as_ref().join(SEALED_SESSION_FILE),
            passphrase: Some(passphrase.as_bytes().to_vec()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, session: &Session) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(session).context("Failed to serialize session")?;
        match self.passphrase {
            Some(ref passphrase) => seal(passphrase, &json),
            None => Ok(json),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Session> {
        let json = match self.passphrase {
            Some(ref passphrase) => open(passphrase, bytes)?,
            None => bytes.to_vec(),
        };
        serde_json::from_slice(&json).context("Failed to parse session file")
    }
}

impl TokenStore for FileTokenStore {
    fn write(&self, session: &Session) -> Result<()> {
        let bytes = self.encode(session)?;
        write_atomic(&self.path, &bytes)?;
        debug!(path = %self.path.display(), "Session written");
        Ok(())
    }

    fn read(&self) -> Result<Option<Session>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read session file"),
        };
        self.decode(&bytes).map(Some)
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Session file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove session file"),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create session directory")?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp)
            .context("Failed to open temporary session file")?;
        file.write_all(bytes)
            .context("Failed to write temporary session file")?;
        file.sync_all()
            .context("Failed to flush temporary session file")?;
    }

    fs::rename(&tmp, path).context("Failed to replace session file")?;
    Ok(())
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| anyhow!("Failed to derive session key: {}", e))?;
    Ok(key)
}

fn seal(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("Failed to encrypt session"))?;

    let mut out = Vec::with_capacity(SEALED_MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(SEALED_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(passphrase: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let header_len = SEALED_MAGIC.len() + SALT_LEN + NONCE_LEN;
    if sealed.len() <= header_len || !sealed.starts_with(SEALED_MAGIC) {
        bail!("Sealed session file is malformed");
    }

    let salt = &sealed[SEALED_MAGIC.len()..SEALED_MAGIC.len() + SALT_LEN];
    let nonce = &sealed[SEALED_MAGIC.len() + SALT_LEN..header_len];
    let ciphertext = &sealed[header_len..];

    let key = derive_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("Failed to decrypt session (wrong passphrase or corrupted file)"))
}
