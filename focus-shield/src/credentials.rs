// Credential encryption at rest

//! Encrypt/decrypt capability for stored secrets
//!
//! Secrets (the remote access key) are stored as
//! `base64(nonce || ciphertext)` using AES-256-GCM under a 32-byte master key
//! kept in its own file. Failures never propagate: callers get an empty
//! string and the error is logged.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypt/decrypt capability; failures degrade to an empty string
pub trait CredentialStore: Send + Sync {
    /// Encoded ciphertext for `plain`
    fn encrypt(&self, plain: &str) -> String;
    /// Plaintext for `encoded`, empty when it does not decrypt
    fn decrypt(&self, encoded: &str) -> String;
}

/// AES-256-GCM credential store keyed from a master key file
pub struct AesGcmCredentials {
    key_path: PathBuf,
    key: Mutex<Option<[u8; MASTER_KEY_LEN]>>,
}

impl AesGcmCredentials {
    /// The key file is created with mode 0600 on first use
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            key: Mutex::new(None),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let mut cached = self
            .key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = match *cached {
            Some(key) => key,
            None => {
                let key = load_or_create_master_key(&self.key_path)?;
                *cached = Some(key);
                key
            }
        };

        Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow::anyhow!("Invalid master key length"))
    }

    fn try_encrypt(&self, plain: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain.as_bytes())
            .map_err(|_| anyhow::anyhow!("Encryption failed"))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn try_decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64
            .decode(encoded.trim().as_bytes())
            .context("Stored secret is not valid base64")?;
        if combined.len() <= NONCE_LEN {
            anyhow::bail!("Stored secret is too short");
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("Decryption failed"))?;
        String::from_utf8(plain).context("Decrypted secret is not UTF-8")
    }
}

impl CredentialStore for AesGcmCredentials {
    fn encrypt(&self, plain: &str) -> String {
        if plain.is_empty() {
            return String::new();
        }
        self.try_encrypt(plain).unwrap_or_else(|e| {
            log::error!("Failed to encrypt secret: {:#}", e);
            String::new()
        })
    }

    fn decrypt(&self, encoded: &str) -> String {
        if encoded.is_empty() {
            return String::new();
        }
        self.try_decrypt(encoded).unwrap_or_else(|e| {
            log::error!("Failed to decrypt secret: {:#}", e);
            String::new()
        })
    }
}

fn load_or_create_master_key(path: &Path) -> Result<[u8; MASTER_KEY_LEN]> {
    if path.exists() {
        let encoded = fs::read_to_string(path).context("Failed to read master key")?;
        let decoded = BASE64
            .decode(encoded.trim().as_bytes())
            .context("Master key is not valid base64")?;
        if decoded.len() != MASTER_KEY_LEN {
            anyhow::bail!("Master key must be {} bytes", MASTER_KEY_LEN);
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(&decoded);
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create master key directory")?;
    }

    let mut key = [0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut key);

    let mut file = create_private(path).context("Failed to create master key file")?;
    file.write_all(BASE64.encode(key).as_bytes())?;
    file.flush()?;

    log::info!("Created new master key at {:?}", path);
    Ok(key)
}

/// New file readable only by its owner from the moment it exists
fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let store = AesGcmCredentials::new(dir.path().join("master.key"));

        let encrypted = store.encrypt("super-secret-access-key");
        assert_ne!(encrypted, "super-secret-access-key");
        assert!(!encrypted.is_empty());
        assert_eq!(store.decrypt(&encrypted), "super-secret-access-key");
    }

    #[test]
    fn test_empty_stays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AesGcmCredentials::new(dir.path().join("master.key"));
        assert_eq!(store.encrypt(""), "");
        assert_eq!(store.decrypt(""), "");
        assert!(!dir.path().join("master.key").exists());
    }

    #[test]
    fn test_nonce_is_random() {
        let dir = tempfile::tempdir().unwrap();
        let store = AesGcmCredentials::new(dir.path().join("master.key"));
        assert_ne!(store.encrypt("same"), store.encrypt("same"));
    }

    #[test]
    fn test_key_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("keys").join("master.key");

        let encrypted = AesGcmCredentials::new(&key_path).encrypt("value");
        let reopened = AesGcmCredentials::new(&key_path);
        assert_eq!(reopened.decrypt(&encrypted), "value");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("master.key");
        AesGcmCredentials::new(&key_path).encrypt("value");

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_private_before_first_write() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.key");
        let file = create_private(&path).unwrap();

        // Nothing written yet, the mode already excludes group and other
        assert_eq!(file.metadata().unwrap().len(), 0);
        let mode = file.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert!(create_private(&path).is_err());
    }

    #[test]
    fn test_tampered_or_foreign_input_decrypts_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AesGcmCredentials::new(dir.path().join("master.key"));

        assert_eq!(store.decrypt("not base64 !!"), "");
        assert_eq!(store.decrypt(&BASE64.encode([0u8; 8])), "");

        let mut raw = BASE64.decode(store.encrypt("value")).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert_eq!(store.decrypt(&BASE64.encode(raw)), "");

        let other = AesGcmCredentials::new(dir.path().join("other.key"));
        assert_eq!(other.decrypt(&store.encrypt("value")), "");
    }

    #[test]
    fn test_corrupt_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("master.key");
        fs::write(&key_path, BASE64.encode([1u8; 5])).unwrap();
        assert_eq!(AesGcmCredentials::new(&key_path).encrypt("value"), "");
    }
}
