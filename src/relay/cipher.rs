//! Encryption at rest for persisted frames
//!
//! Frames are sealed with AES-256-GCM. A sealed frame is the 12-byte nonce
//! followed by the ciphertext and tag. The key comes from a named
//! [`KeyProvider`] resolved once through a [`KeyProviderRegistry`].

use crate::core::{RelayError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const NONCE_LEN: usize = 12;

/// Environment variable read by [`EnvironmentKeyProvider`]
pub const SECRET_KEY_ENV: &str = "RELAY_SECRET_KEY";

/// A 256-bit symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Stretch an arbitrary passphrase to a 256-bit key
    pub fn derive(passphrase: &[u8]) -> Self {
        Self(Sha256::digest(passphrase).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Source of the encryption key
pub trait KeyProvider: Send + Sync {
    fn secret_key(&self) -> Result<SecretKey>;
}

/// Provider returning a key supplied by the caller
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: SecretKey,
}

impl StaticKeyProvider {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn secret_key(&self) -> Result<SecretKey> {
        Ok(self.key.clone())
    }
}

/// Provider deriving the key from the `RELAY_SECRET_KEY` passphrase
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentKeyProvider;

impl KeyProvider for EnvironmentKeyProvider {
    fn secret_key(&self) -> Result<SecretKey> {
        let passphrase = std::env::var(SECRET_KEY_ENV)
            .map_err(|_| RelayError::encryption(format!("{} is not set", SECRET_KEY_ENV)))?;
        if passphrase.is_empty() {
            return Err(RelayError::encryption(format!("{} is empty", SECRET_KEY_ENV)));
        }
        Ok(SecretKey::derive(passphrase.as_bytes()))
    }
}

/// Constructor registered under a provider name
pub type KeyProviderFactory = Arc<dyn Fn() -> Box<dyn KeyProvider> + Send + Sync>;

/// Name → provider constructor table, populated explicitly at startup
///
/// Lookups ignore ASCII case.
#[derive(Clone, Default)]
pub struct KeyProviderRegistry {
    factories: HashMap<String, KeyProviderFactory>,
}

impl KeyProviderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `environment` provider
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("environment", || Box::new(EnvironmentKeyProvider));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn KeyProvider> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register a fixed key under `name`
    pub fn register_static(&mut self, name: &str, key: SecretKey) {
        self.register(name, move || Box::new(StaticKeyProvider::new(key.clone())));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Construct the named provider and obtain its key
    pub fn resolve(&self, name: &str) -> Result<SecretKey> {
        let factory = self
            .factories
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| RelayError::encryption(format!("Unknown key provider '{}'", name)))?;
        factory().secret_key()
    }
}

impl fmt::Debug for KeyProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Seals frames before they are stored and opens them after a scan
#[derive(Clone)]
pub struct CipherGate {
    cipher: Aes256Gcm,
}

impl CipherGate {
    pub fn new(key: &SecretKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| RelayError::encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| RelayError::encryption("failed to encrypt frame"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(RelayError::encryption("sealed frame shorter than nonce"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RelayError::encryption("failed to decrypt frame"))
    }
}

impl fmt::Debug for CipherGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherGate(AES-256-GCM)")
    }
}
