//! Credential vault: AES-256-GCM encryption for all sensitive fields.
//!
//! Encrypted fields are stored as text columns using a double-base64 token:
//! the inner blob is `version(1) || nonce(12) || ciphertext+tag`, base64-url
//! encoded once into a token string, then base64-url encoded a second time
//! for storage. The leading version byte (`0x80`) lets `is_encrypted` detect
//! vault tokens without attempting a decryption.
//!
//! Key material is resolved in order: configured key (env var) → key file
//! (single base64-url line, 0600 permissions) → freshly generated key
//! persisted to the key file with a warning.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use crate::config::{expand_tilde, SecurityConfig};
use crate::error::CryptoError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Version marker prefixed to every encrypted blob.
const TOKEN_VERSION: u8 = 0x80;

/// Vault for encrypting and decrypting sensitive application data.
///
/// Construct one vault at startup and pass it by reference into the services
/// that need it; there is no global instance.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build a vault from security configuration.
    ///
    /// Resolution order: `encryption_key` from the config (usually the
    /// `YOURMOMENT_ENCRYPTION_KEY` env var), then the key file, then a new
    /// key generated and persisted to the key file.
    pub fn from_config(security: &SecurityConfig) -> Result<Self, CryptoError> {
        if let Some(key_b64) = security.encryption_key.as_deref() {
            match decode_key(key_b64) {
                Ok(key) => return Self::from_key_bytes(&key),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid encryption key in environment, falling back to key file");
                }
            }
        }

        let key_path = expand_tilde(&security.key_file);
        if key_path.exists() {
            let contents = std::fs::read_to_string(&key_path).map_err(|e| CryptoError::Key {
                message: format!("failed to read key file {}: {e}", key_path.display()),
            })?;
            let key = decode_key(contents.trim())?;
            tracing::info!(path = %key_path.display(), "encryption key loaded from file");
            return Self::from_key_bytes(&key);
        }

        let key = generate_key();
        persist_key(&key_path, &key)?;
        tracing::warn!(
            path = %key_path.display(),
            "generated new encryption key; for production set YOURMOMENT_ENCRYPTION_KEY and distribute it securely"
        );
        Self::from_key_bytes(&key)
    }

    /// Build a vault from raw 32-byte key material.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::Key {
                message: format!("key length {} != {KEY_LEN}", key.len()),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Key {
            message: format!("cipher init failed: {e}"),
        })?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext string into a storage token.
    ///
    /// Encrypting the empty string returns the empty string so that "not set"
    /// round-trips as "not set".
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt {
                message: format!("encryption failed: {e}"),
            })?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(TOKEN_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let token = URL_SAFE.encode(&blob);
        Ok(URL_SAFE.encode(token.as_bytes()))
    }

    /// Decrypt a storage token back into its plaintext.
    ///
    /// Decrypting the empty string returns the empty string. Any structural
    /// mismatch, wrong key, or tampering fails with [`CryptoError::Decrypt`].
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        let token_bytes = URL_SAFE.decode(stored).map_err(|_| CryptoError::Decrypt)?;
        let token = std::str::from_utf8(&token_bytes).map_err(|_| CryptoError::Decrypt)?;
        let blob = URL_SAFE.decode(token).map_err(|_| CryptoError::Decrypt)?;

        if blob.len() < 1 + NONCE_LEN + TAG_LEN || blob[0] != TOKEN_VERSION {
            return Err(CryptoError::Decrypt);
        }

        let (nonce_bytes, ciphertext) = blob[1..].split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }

    /// Heuristic check whether a value looks like a vault token.
    ///
    /// True iff the value is double-base64-decodable and the inner blob
    /// starts with the token version marker at a plausible length.
    pub fn is_encrypted(&self, data: &str) -> bool {
        if data.is_empty() {
            return false;
        }
        let Ok(token_bytes) = URL_SAFE.decode(data) else {
            return false;
        };
        let Ok(token) = std::str::from_utf8(&token_bytes) else {
            return false;
        };
        let Ok(blob) = URL_SAFE.decode(token) else {
            return false;
        };
        blob.len() >= 1 + NONCE_LEN + TAG_LEN && blob[0] == TOKEN_VERSION
    }

    // --- Field-specific helpers ---

    /// Encrypt an LLM provider API key for storage.
    pub fn encrypt_api_key(&self, api_key: &str) -> Result<String, CryptoError> {
        self.encrypt(api_key)
    }

    /// Decrypt an LLM provider API key from storage.
    pub fn decrypt_api_key(&self, encrypted: &str) -> Result<String, CryptoError> {
        self.decrypt(encrypted)
    }

    /// Encrypt a platform credential pair for storage.
    pub fn encrypt_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(String, String), CryptoError> {
        Ok((self.encrypt(username)?, self.encrypt(password)?))
    }

    /// Decrypt a platform credential pair from storage.
    pub fn decrypt_credentials(
        &self,
        encrypted_username: &str,
        encrypted_password: &str,
    ) -> Result<(String, String), CryptoError> {
        Ok((
            self.decrypt(encrypted_username)?,
            self.decrypt(encrypted_password)?,
        ))
    }

    /// Encrypt structured session data (cookies, tokens) for storage.
    pub fn encrypt_session_data(&self, data: &serde_json::Value) -> Result<String, CryptoError> {
        let json = serde_json::to_string(data).map_err(|e| CryptoError::Encrypt {
            message: format!("session data serialization failed: {e}"),
        })?;
        self.encrypt(&json)
    }

    /// Decrypt session data from storage back into JSON.
    ///
    /// The empty string decrypts to an empty JSON object.
    pub fn decrypt_session_data(&self, encrypted: &str) -> Result<serde_json::Value, CryptoError> {
        let json = self.decrypt(encrypted)?;
        if json.is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&json).map_err(|_| CryptoError::Decrypt)
    }
}

/// Generate fresh 32-byte key material.
pub fn generate_key() -> Vec<u8> {
    (0..KEY_LEN).map(|_| rand::random::<u8>()).collect()
}

/// Decode a base64-url key string into raw bytes, checking the length.
fn decode_key(key_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let key = URL_SAFE.decode(key_b64).map_err(|e| CryptoError::Key {
        message: format!("key is not valid base64: {e}"),
    })?;
    if key.len() != KEY_LEN {
        return Err(CryptoError::Key {
            message: format!("key length {} != {KEY_LEN}", key.len()),
        });
    }
    Ok(key)
}

/// Persist key material to a file as a single base64-url line with 0600
/// permissions (Unix).
fn persist_key(path: &Path, key: &[u8]) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CryptoError::Key {
            message: format!("failed to create key directory {}: {e}", parent.display()),
        })?;
    }

    std::fs::write(path, URL_SAFE.encode(key)).map_err(|e| CryptoError::Key {
        message: format!("failed to write key file {}: {e}", path.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|e| CryptoError::Key {
            message: format!("failed to set key file permissions: {e}"),
        })?;
    }

    Ok(())
}
