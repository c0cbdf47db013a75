//! Secret encryption
//!
//! - [`SecretCipher`]: local secrets at rest (token, proxy password, private
//!   key) with AES-256-GCM. Format: base64(nonce_12bytes || ciphertext || tag_16bytes).
//! - [`KeyPair`]: RSA key pair exchanged with the cloud at registration. The
//!   cloud encrypts connector secrets with the public key (OAEP, SHA-256).

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use shared::error::AppError;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key wrong length: {0} (expected {KEY_LEN})")]
    KeyLength(usize),

    #[error("Ciphertext too short")]
    TooShort,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed (wrong key or tampered data)")]
    Decrypt,

    #[error("Decrypted data is not valid UTF-8")]
    Utf8,

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Key encoding error: {0}")]
    Pkcs8(String),
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        AppError::crypto(err.to_string())
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Local encryption key (32 bytes for AES-256-GCM)
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}

impl SecretCipher {
    /// Load the key file, or create it with a fresh random key
    pub fn load_or_create(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            let b64_key = std::fs::read_to_string(path)?;
            let mut bytes = b64().decode(b64_key.trim())?;
            if bytes.len() != KEY_LEN {
                let len = bytes.len();
                bytes.zeroize();
                return Err(CryptoError::KeyLength(len));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            bytes.zeroize();
            tracing::info!(path = %path.display(), "Cipher key loaded");
            return Ok(Self { key });
        }

        let cipher = Self::random();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b64().encode(cipher.key))?;
        tracing::info!(path = %path.display(), "Cipher key created");
        Ok(cipher)
    }

    /// Fresh random key, not persisted
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
        Self { key }
    }

    /// Encrypt plaintext → base64(nonce || ciphertext || tag)
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(b64().encode(&result))
    }

    /// Decrypt base64(nonce || ciphertext || tag) → plaintext
    pub fn decrypt(&self, encrypted_b64: &str) -> CryptoResult<Vec<u8>> {
        let data = b64().decode(encrypted_b64)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::Decrypt)?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn encrypt_string(&self, plaintext: &str) -> CryptoResult<String> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_string(&self, encrypted_b64: &str) -> CryptoResult<String> {
        let bytes = self.decrypt(encrypted_b64)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Utf8)
    }

    /// Decrypt an optional stored secret; empty or missing gives `None`
    pub fn decrypt_optional(&self, encrypted: Option<&str>) -> CryptoResult<Option<String>> {
        match encrypted {
            Some(value) if !value.is_empty() => self.decrypt_string(value).map(Some),
            _ => Ok(None),
        }
    }
}

/// RSA key pair as PEM strings (SPKI public, PKCS#8 private)
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl KeyPair {
    /// Generate a key pair. CPU bound; call from `spawn_blocking`.
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        let public = RsaPublicKey::from(&private);

        let private_key = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pkcs8(e.to_string()))?
            .to_string();
        let public_key = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pkcs8(e.to_string()))?;

        Ok(Self {
            public_key,
            private_key,
        })
    }
}

/// Decrypt a base64 RSA-OAEP(SHA-256) ciphertext with a PKCS#8 PEM private key
pub fn decrypt_with_private_key(private_key_pem: &str, encrypted_b64: &str) -> CryptoResult<String> {
    let private = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| CryptoError::Pkcs8(e.to_string()))?;
    let data = b64().decode(encrypted_b64.trim())?;
    let plaintext = private.decrypt(Oaep::new::<Sha256>(), &data)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Encrypt with an SPKI PEM public key → base64, as the cloud does
pub fn encrypt_with_public_key(public_key_pem: &str, plaintext: &str) -> CryptoResult<String> {
    let public = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| CryptoError::Pkcs8(e.to_string()))?;
    let data = public.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext.as_bytes())?;
    Ok(b64().encode(data))
}
