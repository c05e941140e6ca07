//! Certificate password encryption at rest.
//!
//! The `SecretStore` owns the single process-wide AES-256-GCM key used to
//! encrypt certificate passwords before they touch the database. The key is
//! derived from a long-lived master secret (SHA-256 of the secret bytes) so
//! it is never stored alongside any ciphertext. A missing master secret is a
//! constructor error, to be treated as fatal configuration at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use secrecy::SecretString;
use sha2::{Digest, Sha256};

/// Environment variable holding the master secret.
pub const MASTER_KEY_ENV_VAR: &str = "EMISSOR_MASTER_KEY";

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Error type for secret store failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Decryption error: {0}")]
    DecryptionError(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Encrypts and decrypts certificate passwords with AES-256-GCM.
///
/// Ciphertext blobs are hex-encoded `nonce || cipher`, a fresh random nonce
/// per encryption. Decryption fails closed on any tamper, truncation, or
/// key mismatch. Passed around by explicit injection, never a global.
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl SecretStore {
    /// Creates a store from the `EMISSOR_MASTER_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the variable is unset or empty. Callers
    /// should treat this as a fatal configuration error.
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var(MASTER_KEY_ENV_VAR).map_err(|_| {
            SecretError::InvalidKey(format!(
                "Environment variable {} not set",
                MASTER_KEY_ENV_VAR
            ))
        })?;
        Self::from_secret(&secret)
    }

    /// Creates a store from a master secret string.
    ///
    /// The AES key is SHA-256 of the secret bytes, so any non-empty
    /// passphrase yields a full-length key.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(SecretError::InvalidKey(
                "Master secret must not be empty".to_string(),
            ));
        }

        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::InvalidKey(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypts a plaintext password, returning hex of `nonce || cipher`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptionError(e.to_string()))?;

        let mut combined = nonce.to_vec();
        combined.extend(ciphertext);

        Ok(hex_encode(&combined))
    }

    /// Decrypts a hex `nonce || cipher` blob back to the plaintext password.
    ///
    /// Fails closed: bad hex, a truncated blob, or an authentication tag
    /// mismatch all raise `DecryptionError` and never yield a plausible
    /// wrong plaintext.
    pub fn decrypt(&self, ciphertext_hex: &str) -> Result<SecretString> {
        let combined = hex_decode(ciphertext_hex)
            .map_err(|e| SecretError::DecryptionError(format!("Invalid hex: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(SecretError::DecryptionError(
                "Ciphertext too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SecretError::DecryptionError(e.to_string()))?;

        let plaintext = String::from_utf8(plaintext_bytes)
            .map_err(|e| SecretError::DecryptionError(format!("Invalid UTF-8: {}", e)))?;

        Ok(SecretString::from(plaintext))
    }
}

/// Encodes bytes as lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

/// Decodes hex string to bytes.
fn hex_decode(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("Hex string must have even length".to_string());
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex at position {}: {}", i, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    const TEST_SECRET: &str = "a-long-lived-master-secret-for-tests";

    #[test]
    fn test_roundtrip() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();
        let plaintext = "senha-do-certificado-123";

        let ciphertext = store.encrypt(plaintext).unwrap();
        let decrypted = store.decrypt(&ciphertext).unwrap();

        assert_eq!(decrypted.expose_secret(), plaintext);
    }

    #[test]
    fn test_different_ciphertext_each_time() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();
        let plaintext = "same-plaintext";

        let ciphertext1 = store.encrypt(plaintext).unwrap();
        let ciphertext2 = store.encrypt(plaintext).unwrap();

        // Fresh nonce per encryption, so ciphertexts differ.
        assert_ne!(ciphertext1, ciphertext2);

        assert_eq!(store.decrypt(&ciphertext1).unwrap().expose_secret(), plaintext);
        assert_eq!(store.decrypt(&ciphertext2).unwrap().expose_secret(), plaintext);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let result = SecretStore::from_secret("");
        assert!(matches!(result, Err(SecretError::InvalidKey(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_missing() {
        std::env::remove_var(MASTER_KEY_ENV_VAR);
        let result = SecretStore::from_env();
        assert!(matches!(result, Err(SecretError::InvalidKey(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_present() {
        std::env::set_var(MASTER_KEY_ENV_VAR, "env-master-secret");
        let store = SecretStore::from_env().unwrap();
        let ciphertext = store.encrypt("pw").unwrap();
        assert_eq!(store.decrypt(&ciphertext).unwrap().expose_secret(), "pw");
        std::env::remove_var(MASTER_KEY_ENV_VAR);
    }

    #[test]
    fn test_decrypt_invalid_inputs() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();

        // Invalid hex
        let result = store.decrypt("not-hex!");
        assert!(matches!(result, Err(SecretError::DecryptionError(_))));

        // Too short (less than nonce size)
        let result = store.decrypt("aabbccdd");
        assert!(matches!(result, Err(SecretError::DecryptionError(_))));
    }

    #[test]
    fn test_decrypt_tampered_ciphertext() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();

        let ciphertext = store.encrypt("senha").unwrap();
        let mut tampered = hex_decode(&ciphertext).unwrap();
        if let Some(byte) = tampered.last_mut() {
            *byte ^= 0xff;
        }
        let tampered_hex = hex_encode(&tampered);
        let result = store.decrypt(&tampered_hex);
        assert!(matches!(result, Err(SecretError::DecryptionError(_))));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();
        let other = SecretStore::from_secret("a-different-master-secret").unwrap();

        let ciphertext = store.encrypt("senha").unwrap();
        let result = other.decrypt(&ciphertext);
        assert!(matches!(result, Err(SecretError::DecryptionError(_))));
    }

    #[test]
    fn test_unicode_password() {
        let store = SecretStore::from_secret(TEST_SECRET).unwrap();
        let plaintext = "señha çertificado 証明書";

        let ciphertext = store.encrypt(plaintext).unwrap();
        assert_eq!(store.decrypt(&ciphertext).unwrap().expose_secret(), plaintext);
    }

    #[test]
    fn test_hex_roundtrip() {
        let original = vec![0x00, 0xff, 0x12, 0xab, 0xcd, 0xef];
        let encoded = hex_encode(&original);
        assert_eq!(encoded, "00ff12abcdef");
        assert_eq!(hex_decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_hex_decode_errors() {
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("ghij").is_err());
    }
}
