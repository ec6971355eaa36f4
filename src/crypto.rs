use crate::errors::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use serde::{Deserialize, Serialize};

const KEYRING_SERVICE: &str = "cloud-migration";
const KEYRING_ACCOUNT: &str = "artifact-encryption-key";
const ALGORITHM: &str = "aes-256-gcm";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPayload {
    pub alg: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Seals secrets and artifacts at rest with AES-256-GCM.
#[derive(Clone)]
pub struct Sealer {
    key: [u8; 32],
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

impl Sealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> AppResult<Self> {
        Ok(Self::new(decode_key(encoded)?))
    }

    /// Reads the key from the OS keyring, creating and storing one only when no
    /// entry exists yet. Any other keyring failure is returned as is.
    pub fn from_keyring() -> AppResult<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|error| AppError::Io(error.to_string()))?;

        if let Some(key) = stored_key(entry.get_password())? {
            return Ok(Self::new(key));
        }

        let key: [u8; 32] = rand::random();
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        entry
            .set_password(&encoded)
            .map_err(|error| AppError::Io(error.to_string()))?;
        tracing::info!("stored a new encryption key in the OS keyring");
        Ok(Self::new(key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> AppResult<SealedPayload> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|error| AppError::Internal(error.to_string()))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let encrypted = cipher
            .encrypt(nonce, plaintext)
            .map_err(|error| AppError::Internal(error.to_string()))?;

        Ok(SealedPayload {
            alg: ALGORITHM.to_string(),
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
            ciphertext: base64::engine::general_purpose::STANDARD.encode(encrypted),
        })
    }

    pub fn open(&self, sealed: &SealedPayload) -> AppResult<Vec<u8>> {
        if sealed.alg != ALGORITHM {
            return Err(AppError::Internal(format!("unsupported sealing algorithm '{}'", sealed.alg)));
        }
        let nonce_bytes = base64::engine::general_purpose::STANDARD
            .decode(&sealed.nonce)
            .map_err(|error| AppError::Internal(error.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(AppError::Internal("sealed payload has a malformed nonce".to_string()));
        }
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|error| AppError::Internal(error.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|error| AppError::Internal(error.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| AppError::Internal("sealed payload failed authentication".to_string()))
    }

    pub fn seal_to_string(&self, plaintext: &str) -> AppResult<String> {
        Ok(serde_json::to_string(&self.seal(plaintext.as_bytes())?)?)
    }

    pub fn open_string(&self, sealed: &str) -> AppResult<String> {
        let payload: SealedPayload = serde_json::from_str(sealed)?;
        let bytes = self.open(&payload)?;
        String::from_utf8(bytes).map_err(|error| AppError::Internal(error.to_string()))
    }
}

fn stored_key(stored: Result<String, keyring::Error>) -> AppResult<Option<[u8; 32]>> {
    match stored {
        Ok(value) => decode_key(&value)
            .map(Some)
            .map_err(|error| AppError::Io(format!("keyring holds a malformed encryption key: {}", error.message()))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(AppError::Io(format!("failed to read encryption key from keyring: {error}"))),
    }
}

fn decode_key(encoded: &str) -> AppResult<[u8; 32]> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|error| AppError::Validation(format!("encryption key is not base64: {error}")))?;
    if decoded.len() != 32 {
        return Err(AppError::Validation(format!(
            "encryption key must be 32 bytes, got {}",
            decoded.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded);
    Ok(key)
}
