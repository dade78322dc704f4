//! Secret handling for flowstore
//!
//! Supplies the secret the integrity layer derives its MAC key from.
//!
//! Providers:
//! - Static: bytes supplied by the embedding application
//! - File: hex-encoded secret file with owner-only permissions, generated on first use
//! - Keyring: OS credential store (macOS Keychain, Windows Credential Manager,
//!   Linux keyutils), generated on first use
//!
//! Rotation is not supported: a new secret makes every previously wrapped
//! entry fail verification.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of generated secrets in bytes
pub const SECRET_LEN: usize = 32;

const DEFAULT_SERVICE_NAME: &str = "Flowstore";
const DEFAULT_ACCOUNT: &str = "integrity-secret";

/// Permission mode for directories (owner rwx only)
pub const DIR_PERMISSIONS: u32 = 0o700;

/// Permission mode for private files (owner rw only)
pub const FILE_PERMISSIONS: u32 = 0o600;

/// Set secure permissions on a path. On non-Unix systems this is a no-op.
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_secure_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Create a directory with secure permissions (0o700), parents included.
pub fn create_secure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    set_secure_permissions(path, DIR_PERMISSIONS)
}

/// Atomically replace `path` with `contents`, fsynced, mode 0o600.
///
/// Writes to a temp file in the same directory and renames it over the
/// target, so readers see either the old or the new file, never a mix.
pub fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = NamedTempFile::new_in(&parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    set_secure_permissions(path, FILE_PERMISSIONS)
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Keychain error: {0}")]
    Keychain(String),
    #[error("File I/O error: {0}")]
    FileIO(String),
    #[error("Invalid secret format")]
    InvalidFormat,
    #[error("Secret is empty")]
    Empty,
}

/// Securely zeroed MAC secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MacSecret {
    bytes: Vec<u8>,
}

impl MacSecret {
    /// Generate a new random secret
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from existing bytes (takes ownership)
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SecretError> {
        if bytes.is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded secret, ignoring surrounding whitespace
    pub fn from_hex(encoded: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| SecretError::InvalidFormat)?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex encoding for persistence.
    /// SECURITY: Caller MUST zeroize the returned String after use.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl std::fmt::Debug for MacSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the actual value in debug output
        f.debug_struct("MacSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Source of the integrity secret
pub trait SecretProvider {
    fn load_secret(&self) -> Result<MacSecret, SecretError>;
}

/// Secret held in memory, supplied by the embedding application
pub struct StaticSecret {
    bytes: Vec<u8>,
}

impl StaticSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl Drop for StaticSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl SecretProvider for StaticSecret {
    fn load_secret(&self) -> Result<MacSecret, SecretError> {
        MacSecret::from_bytes(self.bytes.clone())
    }
}

/// Hex-encoded secret stored in a private file
pub struct FileSecret {
    path: PathBuf,
}

impl FileSecret {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretProvider for FileSecret {
    fn load_secret(&self) -> Result<MacSecret, SecretError> {
        if self.path.exists() {
            let mut content =
                fs::read_to_string(&self.path).map_err(|e| SecretError::FileIO(e.to_string()))?;
            let secret = MacSecret::from_hex(&content);
            content.zeroize();
            return secret;
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_secure_dir(parent).map_err(|e| SecretError::FileIO(e.to_string()))?;
            }
        }

        let secret = MacSecret::generate();
        let mut encoded = secret.to_hex();
        let written = write_private_file(&self.path, encoded.as_bytes());
        encoded.zeroize();
        written.map_err(|e| SecretError::FileIO(e.to_string()))?;
        tracing::info!("Generated new integrity secret at {}", self.path.display());
        Ok(secret)
    }
}

/// Secret stored in the OS credential store
pub struct KeyringSecret {
    service: String,
    account: String,
}

impl Default for KeyringSecret {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME, DEFAULT_ACCOUNT)
    }
}

impl KeyringSecret {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, SecretError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| SecretError::Keychain(e.to_string()))
    }

    /// Remove the stored secret
    pub fn delete(&self) -> Result<(), SecretError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Keychain(e.to_string())),
        }
    }
}

impl SecretProvider for KeyringSecret {
    fn load_secret(&self) -> Result<MacSecret, SecretError> {
        let entry = self.entry()?;

        match entry.get_secret() {
            Ok(bytes) => MacSecret::from_bytes(bytes),
            Err(keyring::Error::NoEntry) => {
                let secret = MacSecret::generate();
                entry
                    .set_secret(secret.as_bytes())
                    .map_err(|e| SecretError::Keychain(e.to_string()))?;
                tracing::info!("Generated new integrity secret in keychain");
                Ok(secret)
            }
            Err(e) => Err(SecretError::Keychain(e.to_string())),
        }
    }
}
