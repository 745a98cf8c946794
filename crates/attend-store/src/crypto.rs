//! At-rest encryption for stored face embeddings.
//!
//! AES-256-GCM with a random per-write nonce; the blob layout is
//! `nonce (12 bytes) || ciphertext`. The 32-byte key lives in a file next to
//! the database, created on first use with mode 0600.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypts and decrypts embedding blobs with a single symmetric key.
#[derive(Clone)]
pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl EmbeddingCipher {
    /// Load the key file, or generate one if it does not exist yet.
    pub fn load_or_create(key_path: &Path) -> std::io::Result<Self> {
        let key_bytes = match std::fs::read(key_path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                key
            }
            Ok(bytes) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "key file {} has wrong length {} (expected {KEY_LEN})",
                        key_path.display(),
                        bytes.len()
                    ),
                ));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = key_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                std::fs::write(key_path, key)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
                }
                tracing::info!(path = %key_path.display(), "generated new embedding key");
                key
            }
            Err(e) => return Err(e),
        };

        Ok(Self::from_key(&key_bytes))
    }

    /// Cipher with a random throwaway key (in-memory stores, tests).
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_key(&key)
    }

    fn from_key(key_bytes: &[u8; KEY_LEN]) -> Self {
        let digest = Sha256::digest(key_bytes);
        let fingerprint = digest[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes)),
            fingerprint,
        }
    }

    /// Short SHA-256 fingerprint of the key, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt a plaintext blob; returns `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self.cipher.encrypt(nonce, plaintext).ok()?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Some(out)
    }

    /// Decrypt a `nonce || ciphertext` blob. `None` on tamper or key
    /// mismatch.
    pub fn decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, ciphertext).ok()
    }
}
