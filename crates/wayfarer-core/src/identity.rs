//! Device key material and the secure credential store seam
//!
//! The device key pair is the root of all conversation keys. It lives in a
//! platform credential store (keychain, keystore) behind the
//! [`CredentialStore`] capability and is never written to the local mirror
//! store.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{SyncError, SyncResult};
use crate::types::DeviceId;

/// Size of the serialized secret portion of a key pair
const SECRET_LEN: usize = 32;

/// Per-device asymmetric key pair (X25519 static secret).
///
/// Owned exclusively by the authenticated session and supplied to the
/// crypto module as an input; nothing else holds key material.
#[derive(Clone)]
pub struct DeviceKeyPair {
    /// Stable device identifier
    device_id: DeviceId,
    /// X25519 static secret
    secret: X25519StaticSecret,
}

impl DeviceKeyPair {
    /// Generate a fresh key pair for a device.
    pub fn generate(device_id: DeviceId) -> Self {
        let mut seed = [0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut seed);
        Self {
            device_id,
            secret: X25519StaticSecret::from(seed),
        }
    }

    /// Reconstruct a key pair from its serialized secret.
    pub fn from_secret_bytes(device_id: DeviceId, bytes: [u8; SECRET_LEN]) -> Self {
        Self {
            device_id,
            secret: X25519StaticSecret::from(bytes),
        }
    }

    /// The device this key pair belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The X25519 public key.
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.secret)
    }

    /// Raw secret bytes, used as key-derivation input material.
    pub(crate) fn secret_bytes(&self) -> [u8; SECRET_LEN] {
        self.secret.to_bytes()
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material
        f.debug_struct("DeviceKeyPair")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Secure credential store capability.
///
/// Implemented by the host platform (keychain/keystore). The sync core only
/// reads the key pair through this seam and never persists it itself.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the device key pair, if one has been provisioned.
    async fn load_device_keypair(&self) -> SyncResult<Option<DeviceKeyPair>>;

    /// Store (or replace) the device key pair.
    async fn store_device_keypair(&self, keypair: &DeviceKeyPair) -> SyncResult<()>;
}

/// In-memory credential store for tests and embedded use.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    keypair: Arc<Mutex<Option<DeviceKeyPair>>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-provisioned with a key pair.
    pub fn with_keypair(keypair: DeviceKeyPair) -> Self {
        Self {
            keypair: Arc::new(Mutex::new(Some(keypair))),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_device_keypair(&self) -> SyncResult<Option<DeviceKeyPair>> {
        Ok(self.keypair.lock().clone())
    }

    async fn store_device_keypair(&self, keypair: &DeviceKeyPair) -> SyncResult<()> {
        *self.keypair.lock() = Some(keypair.clone());
        Ok(())
    }
}

/// Load the device key pair, erroring if none has been provisioned.
pub async fn require_device_keypair(store: &dyn CredentialStore) -> SyncResult<DeviceKeyPair> {
    store
        .load_device_keypair()
        .await?
        .ok_or_else(|| SyncError::CredentialsMissing("no device key pair provisioned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_secrets() {
        let a = DeviceKeyPair::generate(DeviceId::from_string("d1"));
        let b = DeviceKeyPair::generate(DeviceId::from_string("d2"));
        assert_ne!(a.secret_bytes(), b.secret_bytes());
    }

    #[test]
    fn test_from_secret_bytes_roundtrip() {
        let a = DeviceKeyPair::generate(DeviceId::from_string("d1"));
        let b = DeviceKeyPair::from_secret_bytes(a.device_id().clone(), a.secret_bytes());
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let keypair = DeviceKeyPair::generate(DeviceId::from_string("d1"));
        let rendered = format!("{:?}", keypair);
        let secret_hex = hex::encode(keypair.secret_bytes());
        assert!(!rendered.contains(&secret_hex));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        assert!(store.load_device_keypair().await.unwrap().is_none());

        let keypair = DeviceKeyPair::generate(DeviceId::from_string("d1"));
        store.store_device_keypair(&keypair).await.unwrap();

        let loaded = store.load_device_keypair().await.unwrap().unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
    }

    #[tokio::test]
    async fn test_require_device_keypair_errors_when_empty() {
        let store = MemoryCredentialStore::new();
        let result = require_device_keypair(&store).await;
        assert!(matches!(result, Err(SyncError::CredentialsMissing(_))));
    }
}
