//! Symmetric sealing of gateway credentials at rest.
//!
//! Values are sealed with AES-256-GCM under a random 96-bit nonce. The stored
//! form is `base64(nonce || ciphertext)`, so the same plaintext never produces
//! the same stored value twice.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::errors::ServiceError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Opaque stored form of a sealed secret. Never prints its content.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedValue(String);

impl SealedValue {
    pub fn from_stored(stored: impl Into<String>) -> Self {
        Self(stored.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedValue(***)")
    }
}

#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(key: &[u8]) -> Result<Self, ServiceError> {
        if key.len() != KEY_LEN {
            return Err(ServiceError::EncryptionError(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(key);
        Ok(Self { key: buf })
    }

    /// Builds a cipher from the base64 key held in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, ServiceError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ServiceError::EncryptionError(format!("invalid key encoding: {}", e)))?;
        Self::new(&bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm, ServiceError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| ServiceError::EncryptionError(e.to_string()))
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedValue, ServiceError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ServiceError::EncryptionError(e.to_string()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(SealedValue(STANDARD.encode(out)))
    }

    /// Returns `None` for values that cannot be opened under this key.
    /// Callers treat that the same as an absent credential.
    pub fn open(&self, sealed: &SealedValue) -> Option<String> {
        match self.try_open(sealed) {
            Ok(plain) => Some(plain),
            Err(reason) => {
                warn!(reason = %reason, "Failed to open sealed value");
                None
            }
        }
    }

    /// Convenience for nullable columns holding a sealed value.
    pub fn open_stored(&self, stored: Option<&str>) -> Option<String> {
        stored
            .filter(|s| !s.is_empty())
            .and_then(|s| self.open(&SealedValue::from_stored(s)))
    }

    fn try_open(&self, sealed: &SealedValue) -> Result<String, String> {
        let raw = STANDARD.decode(sealed.as_str()).map_err(|e| e.to_string())?;
        if raw.len() <= NONCE_LEN {
            return Err("sealed value too short".to_string());
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = self.cipher().map_err(|e| e.to_string())?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| "authentication tag mismatch".to_string())?;
        String::from_utf8(plain).map_err(|e| e.to_string())
    }
}

/// Decrypted gateway credentials. Only lives in memory for the duration of a call.
#[derive(Clone, Default)]
pub struct GatewayCredentials {
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl GatewayCredentials {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "***"))
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}
