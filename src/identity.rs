//! Adapter identities
//!
//! One host key presented to clients and one authorized client key. Either
//! both come from OpenSSH files, or a single Ed25519 pair is generated and
//! used for both roles; the private half is then written to a temporary
//! file. Either way the command runner authenticates with the private key
//! file reported by [`Identity::private_key_file`].

use std::io::Write;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AdapterConfig;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid public key in {path}: {reason}")]
    InvalidPublicKey { path: PathBuf, reason: String },

    #[error("Invalid host key in {path}: {reason}")]
    InvalidHostKey { path: PathBuf, reason: String },

    #[error("Both the authorized key and the host key must be given")]
    Incomplete,

    #[error("Key generation failed: {0}")]
    Generate(String),

    #[error("Failed to write private key file: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// Where the keys came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    Files { authorized: PathBuf, host: PathBuf },
    Generated,
}

/// Host key plus the single authorized client key
pub struct Identity {
    host_key: PrivateKey,
    authorized_key: PublicKey,
    origin: KeyOrigin,
    /// Private key handed to the command runner
    key_file: PathBuf,
    /// Temporary file backing `key_file` for a generated pair
    _temp: Option<TempPath>,
}

impl Identity {
    /// Load both keys from OpenSSH files
    pub fn load(authorized_key_file: &Path, host_key_file: &Path) -> Result<Self, IdentityError> {
        let authorized_key = read_public_key(authorized_key_file)?;
        let host_key = russh::keys::load_secret_key(host_key_file, None).map_err(|e| {
            IdentityError::InvalidHostKey {
                path: host_key_file.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        debug!(
            "[identity] loaded host key {} and authorized key {}",
            host_key_file.display(),
            authorized_key_file.display()
        );

        Ok(Self {
            host_key,
            authorized_key,
            origin: KeyOrigin::Files {
                authorized: authorized_key_file.to_path_buf(),
                host: host_key_file.to_path_buf(),
            },
            key_file: host_key_file.to_path_buf(),
            _temp: None,
        })
    }

    /// Generate one Ed25519 pair serving as host key and client key
    pub fn generate() -> Result<Self, IdentityError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| IdentityError::Generate(e.to_string()))?;
        let encoded = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| IdentityError::Generate(e.to_string()))?;

        // NamedTempFile is created with mode 0600.
        let mut file = tempfile::Builder::new()
            .prefix("comm-adapter-key")
            .tempfile()?;
        file.write_all(encoded.as_bytes())?;
        file.flush()?;
        let temp = file.into_temp_path();

        info!("[identity] generated Ed25519 key pair");
        Ok(Self {
            authorized_key: key.public_key().clone(),
            host_key: key,
            origin: KeyOrigin::Generated,
            key_file: temp.to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// Load when key files are configured, generate otherwise
    pub fn from_config(config: &AdapterConfig) -> Result<Self, IdentityError> {
        match (
            config.ssh_authorized_key_file.as_deref(),
            config.ssh_host_key_file.as_deref(),
        ) {
            (Some(authorized), Some(host)) => Self::load(authorized, host),
            (None, None) => Self::generate(),
            _ => Err(IdentityError::Incomplete),
        }
    }

    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    pub fn authorized_key(&self) -> &PublicKey {
        &self.authorized_key
    }

    pub fn origin(&self) -> &KeyOrigin {
        &self.origin
    }

    /// Private key file for the command runner
    ///
    /// The temporary file of a generated pair, otherwise the host key file.
    pub fn private_key_file(&self) -> &Path {
        &self.key_file
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("origin", &self.origin)
            .field("private_key_file", &self.private_key_file())
            .finish()
    }
}

/// Parse the first key line of an OpenSSH `authorized_keys`-style file
fn read_public_key(path: &Path) -> Result<PublicKey, IdentityError> {
    let content = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| IdentityError::InvalidPublicKey {
            path: path.to_path_buf(),
            reason: "no key found".to_string(),
        })?;

    PublicKey::from_openssh(line).map_err(|e| IdentityError::InvalidPublicKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
