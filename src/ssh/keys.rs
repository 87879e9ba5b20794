// ABOUTME: Identity file loading for public key authentication.
// ABOUTME: Expands `~`, reads the key file, and classifies load failures.

use super::error::{Error, KeyLoadErrorKind, Result};
use russh::keys::ssh_key::PrivateKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A loaded private key together with the file it came from.
#[derive(Clone)]
pub struct Credential {
    path: PathBuf,
    key: Arc<PrivateKey>,
}

impl Credential {
    pub fn new(path: impl Into<PathBuf>, key: PrivateKey) -> Self {
        Self {
            path: path.into(),
            key: Arc::new(key),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &Arc<PrivateKey> {
        &self.key
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("path", &self.path)
            .field("algorithm", &self.key.algorithm().as_str())
            .finish()
    }
}

/// Turns an identity file path into a credential.
pub trait KeyLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<Credential>;
}

/// Loads unencrypted OpenSSH/PEM private keys from disk.
#[derive(Debug, Clone, Default)]
pub struct FileKeyLoader;

impl KeyLoader for FileKeyLoader {
    fn load(&self, path: &str) -> Result<Credential> {
        let expanded = expand_home(path);

        let bytes = std::fs::read(&expanded).map_err(|e| Error::KeyLoad {
            path: expanded.clone(),
            kind: if e.kind() == std::io::ErrorKind::NotFound {
                KeyLoadErrorKind::NotFound
            } else {
                KeyLoadErrorKind::Unreadable
            },
            reason: e.to_string(),
        })?;

        let unparseable = |reason: String| Error::KeyLoad {
            path: expanded.clone(),
            kind: KeyLoadErrorKind::Unparseable,
            reason,
        };
        let text = String::from_utf8(bytes).map_err(|e| unparseable(e.to_string()))?;
        let key = russh::keys::decode_secret_key(&text, None)
            .map_err(|e| unparseable(e.to_string()))?;

        tracing::debug!("Loaded {} key from {}", key.algorithm().as_str(), expanded.display());
        Ok(Credential::new(expanded, key))
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };

    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
