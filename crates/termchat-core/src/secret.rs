use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// `iv` value marking a secret that is only base64-encoded, not encrypted.
/// [`seal`] falls back to it when the OS random source fails, and anyone
/// holding the config file can read it. Check [`EncryptedSecret::is_legacy`]
/// before telling a user their prompt is protected.
pub const LEGACY_IV: &str = "plaintext";

pub const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A sealed system prompt as it sits in storage. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Base64 of `salt || ciphertext || tag` (or of the plaintext in legacy form)
    pub ciphertext: String,
    /// Base64 nonce, or [`LEGACY_IV`]
    pub iv: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("wrong password or corrupted secret")]
    Authentication,

    #[error("malformed secret: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("encryption failed")]
    Encryption,
}

impl EncryptedSecret {
    /// Wrap a prompt without encryption. See [`LEGACY_IV`].
    pub fn legacy(plaintext: &str) -> Self {
        Self {
            ciphertext: STANDARD.encode(plaintext.as_bytes()),
            iv: LEGACY_IV.to_string(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.iv == LEGACY_IV
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Recover the plaintext prompt. Legacy secrets ignore the password.
pub fn unwrap(secret: &EncryptedSecret, password: &str) -> Result<String, DecryptionError> {
    if secret.is_legacy() {
        let bytes = STANDARD
            .decode(&secret.ciphertext)
            .map_err(|e| DecryptionError::Malformed(format!("legacy payload: {}", e)))?;
        return String::from_utf8(bytes)
            .map_err(|_| DecryptionError::Malformed("legacy payload is not UTF-8".to_string()));
    }

    let combined = STANDARD
        .decode(&secret.ciphertext)
        .map_err(|e| DecryptionError::Malformed(format!("ciphertext: {}", e)))?;
    let iv = STANDARD
        .decode(&secret.iv)
        .map_err(|e| DecryptionError::Malformed(format!("iv: {}", e)))?;

    if iv.len() != NONCE_LEN {
        return Err(DecryptionError::Malformed(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            iv.len()
        )));
    }
    if combined.len() < SALT_LEN + TAG_LEN {
        return Err(DecryptionError::Malformed("ciphertext is truncated".to_string()));
    }

    let (salt, ciphertext) = combined.split_at(SALT_LEN);
    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| DecryptionError::Malformed("bad key length".to_string()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| DecryptionError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::Authentication)
}

/// Seal a prompt under a password.
///
/// Falls back to the unencrypted legacy form if the OS random source fails.
pub fn seal(plaintext: &str, password: &str) -> Result<EncryptedSecret, SealError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    if let Err(e) = OsRng
        .try_fill_bytes(&mut salt)
        .and_then(|()| OsRng.try_fill_bytes(&mut nonce))
    {
        tracing::warn!(
            error = %e,
            "no secure random source; storing system prompt UNENCRYPTED (legacy encoding)"
        );
        return Ok(EncryptedSecret::legacy(plaintext));
    }

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealError::Encryption)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| SealError::Encryption)?;

    let mut combined = Vec::with_capacity(SALT_LEN + ciphertext.len());
    combined.extend_from_slice(&salt);
    combined.extend_from_slice(&ciphertext);

    Ok(EncryptedSecret {
        ciphertext: STANDARD.encode(combined),
        iv: STANDARD.encode(nonce),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_unwrap() {
        let secret = seal("You are a pirate.", "hunter2").unwrap();
        assert!(!secret.is_legacy());
        assert_eq!(unwrap(&secret, "hunter2").unwrap(), "You are a pirate.");
    }

    #[test]
    fn test_wrong_password_fails_closed() {
        let secret = seal("You are a pirate.", "hunter2").unwrap();
        assert_eq!(
            unwrap(&secret, "hunter3"),
            Err(DecryptionError::Authentication)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let secret = seal("abc", "pw").unwrap();
        let mut bytes = STANDARD.decode(&secret.ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = EncryptedSecret {
            ciphertext: STANDARD.encode(bytes),
            iv: secret.iv.clone(),
        };
        assert_eq!(unwrap(&tampered, "pw"), Err(DecryptionError::Authentication));
    }

    #[test]
    fn test_truncated_blob_is_malformed() {
        let secret = EncryptedSecret {
            ciphertext: STANDARD.encode([0u8; 20]),
            iv: STANDARD.encode([0u8; 12]),
        };
        assert!(matches!(
            unwrap(&secret, "pw"),
            Err(DecryptionError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_nonce_length_is_malformed() {
        let secret = EncryptedSecret {
            ciphertext: STANDARD.encode([0u8; 64]),
            iv: STANDARD.encode([0u8; 8]),
        };
        assert!(matches!(
            unwrap(&secret, "pw"),
            Err(DecryptionError::Malformed(_))
        ));
    }

    #[test]
    fn test_not_base64_is_malformed() {
        let secret = EncryptedSecret {
            ciphertext: "%%%".to_string(),
            iv: "%%%".to_string(),
        };
        assert!(matches!(
            unwrap(&secret, "pw"),
            Err(DecryptionError::Malformed(_))
        ));
    }

    #[test]
    fn test_legacy_ignores_password() {
        let secret = EncryptedSecret::legacy("plain prompt ✓");
        assert!(secret.is_legacy());
        assert_eq!(unwrap(&secret, "").unwrap(), "plain prompt ✓");
        assert_eq!(unwrap(&secret, "anything").unwrap(), "plain prompt ✓");
    }
}
