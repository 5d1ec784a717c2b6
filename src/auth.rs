//! Public-key authentication against per-user authorised-keys files.
//!
//! The store is a directory whose file names are usernames and whose
//! contents are standard OpenSSH `authorized_keys` files. Files are re-read
//! on every attempt so access can be edited without restarting the gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use base64::Engine;
use russh::keys::ssh_key::AuthorizedKeys;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Why an authentication attempt was denied. Everything here is confined to
/// the connection it happened on.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No readable key file for this user. Deliberately covers both a
    /// missing file and an unreadable one, so the client cannot tell the
    /// difference.
    #[error("unknown user {0}")]
    UnknownUser(String),

    /// The presented key's fingerprint is not in the user's key file.
    #[error("unknown key for user {0}")]
    UnknownKey(String),

    /// The user's key file could not be parsed as authorized_keys.
    #[error("malformed authorized_keys file: {0}")]
    Malformed(#[from] russh::keys::ssh_key::Error),
}

/// Metadata granted with a successful authentication.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
}

struct AuthorizedEntry {
    comment: String,
}

/// Resolves a username plus public key to an accept/reject decision.
pub struct Authenticator {
    keys_dir: PathBuf,
}

impl Authenticator {
    /// The path must be an existing, readable directory; anything else is a
    /// configuration error and fatal at startup.
    pub fn new(keys_dir: &Path) -> Result<Self> {
        let meta = std::fs::metadata(keys_dir).with_context(|| {
            format!(
                "authorized_keys dir does not exist at {}",
                keys_dir.display()
            )
        })?;
        ensure!(
            meta.is_dir(),
            "authorized_keys path {} must be a directory",
            keys_dir.display()
        );
        std::fs::read_dir(keys_dir).with_context(|| {
            format!(
                "not able to read authorized_keys directory {}",
                keys_dir.display()
            )
        })?;

        Ok(Self {
            keys_dir: keys_dir.to_path_buf(),
        })
    }

    fn key_file_for(&self, username: &str) -> PathBuf {
        self.keys_dir.join(username)
    }

    /// Check a presented key against the user's key file.
    pub fn authenticate(
        &self,
        username: &str,
        key: &PublicKey,
    ) -> Result<Permissions, AuthError> {
        let path = self.key_file_for(username);
        let entries = match read_authorized_keys(&path) {
            Ok(entries) => entries,
            Err(ReadError::Unreadable(err)) => {
                debug!("Could not read keys for {username}: {err}");
                return Err(AuthError::UnknownUser(username.to_string()));
            }
            Err(ReadError::Parse(err)) => return Err(AuthError::Malformed(err)),
        };

        let fp = fingerprint(key);
        let Some(entry) = entries.get(&fp) else {
            return Err(AuthError::UnknownKey(username.to_string()));
        };

        let friendly = if entry.comment.is_empty() {
            fp.as_str()
        } else {
            entry.comment.as_str()
        };
        info!("Authenticated {username} using {friendly}");

        Ok(Permissions {
            extensions: HashMap::from([("pubkey-fp".to_string(), fp)]),
        })
    }
}

enum ReadError {
    Unreadable(std::io::Error),
    Parse(russh::keys::ssh_key::Error),
}

/// Parse an authorized_keys file into fingerprint-keyed entries. A parse
/// error on any entry aborts the whole file.
fn read_authorized_keys(path: &Path) -> Result<HashMap<String, AuthorizedEntry>, ReadError> {
    debug!("Loading authorized keys from {}", path.display());
    let contents = std::fs::read_to_string(path).map_err(ReadError::Unreadable)?;

    let mut keys = HashMap::new();
    for entry in AuthorizedKeys::new(&contents) {
        let entry = entry.map_err(ReadError::Parse)?;
        let public_key = entry.public_key();
        keys.insert(
            fingerprint(public_key),
            AuthorizedEntry {
                comment: public_key.comment().to_string(),
            },
        );
    }

    Ok(keys)
}

/// Compute the SHA256 fingerprint of an SSH public key over its wire form.
///
/// Returns the "SHA256:..." format used by `ssh-keygen -l`.
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_from_bytes(&key.public_key_bytes())
}

/// SSH fingerprint = SHA256(raw key bytes in SSH wire format), base64
/// without trailing padding.
fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    fn generate_key(comment: &str) -> PublicKey {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut public = key.public_key().clone();
        public.set_comment(comment);
        public
    }

    fn write_key_file(dir: &Path, username: &str, keys: &[&PublicKey]) {
        let lines: Vec<String> = keys
            .iter()
            .map(|key| key.to_openssh().unwrap())
            .collect();
        std::fs::write(dir.join(username), lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_new_rejects_missing_dir() {
        assert!(Authenticator::new(Path::new("/nonexistent/hostel-keys")).is_err());
    }

    #[test]
    fn test_new_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "").unwrap();
        assert!(Authenticator::new(&file).is_err());
    }

    #[test]
    fn test_authenticate_known_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key("alice@laptop");
        write_key_file(dir.path(), "alice", &[&key]);

        let auth = Authenticator::new(dir.path()).unwrap();
        let permissions = auth.authenticate("alice", &key).unwrap();
        assert_eq!(
            permissions.extensions.get("pubkey-fp"),
            Some(&fingerprint(&key))
        );
    }

    #[test]
    fn test_authenticate_matches_any_entry() {
        let dir = tempfile::tempdir().unwrap();
        let first = generate_key("first");
        let second = generate_key("second");
        write_key_file(dir.path(), "alice", &[&first, &second]);

        let auth = Authenticator::new(dir.path()).unwrap();
        assert!(auth.authenticate("alice", &second).is_ok());
    }

    #[test]
    fn test_authenticate_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(dir.path()).unwrap();

        let key = generate_key("bob@laptop");
        assert!(matches!(
            auth.authenticate("bob", &key),
            Err(AuthError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_authenticate_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let authorised = generate_key("alice@laptop");
        write_key_file(dir.path(), "alice", &[&authorised]);

        let auth = Authenticator::new(dir.path()).unwrap();
        let other = generate_key("alice@desktop");
        assert!(matches!(
            auth.authenticate("alice", &other),
            Err(AuthError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_authenticate_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice"), "this is not a public key\n").unwrap();

        let auth = Authenticator::new(dir.path()).unwrap();
        let key = generate_key("alice@laptop");
        assert!(matches!(
            auth.authenticate("alice", &key),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_hot_edit_takes_effect() {
        let dir = tempfile::tempdir().unwrap();
        let old = generate_key("old");
        write_key_file(dir.path(), "alice", &[&old]);

        let auth = Authenticator::new(dir.path()).unwrap();
        let new = generate_key("new");
        assert!(auth.authenticate("alice", &new).is_err());

        // Swap the file contents; the next attempt sees the new key.
        write_key_file(dir.path(), "alice", &[&new]);
        assert!(auth.authenticate("alice", &new).is_ok());
        assert!(auth.authenticate("alice", &old).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let key = generate_key("fmt");
        let fp = fingerprint(&key);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
