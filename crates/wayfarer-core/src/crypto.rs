//! End-to-end encryption for conversation messages
//!
//! Per-conversation symmetric keys are derived deterministically from the
//! device key pair with HKDF-SHA256, so re-deriving after an app restart
//! reproduces the same key without a server round-trip. Message bodies are
//! sealed with ChaCha20-Poly1305; the nonce travels separately in
//! [`CipherMeta`], which the storage layer treats as opaque.
//!
//! This module is pure over the supplied key material: it never touches the
//! local store or the network.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceKeyPair;
use crate::types::{CipherMeta, ConversationId};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Algorithm tag written into [`CipherMeta`]
pub const ALGORITHM: &str = "chacha20poly1305";

/// HKDF salt, fixed per key-derivation scheme version
const KDF_SALT: &[u8] = b"wayfarer-conversation-key-v1";

/// A derived 32-byte conversation key.
#[derive(Clone)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

/// Derive the symmetric key for a conversation from the device key pair.
///
/// Deterministic for a given `(conversation_id, keypair)` pair:
/// `HKDF-SHA256(ikm = x25519 secret, salt = scheme tag, info = conversation id)`.
pub fn derive_conversation_key(
    conversation_id: &ConversationId,
    keypair: &DeviceKeyPair,
) -> ConversationKey {
    let ikm = keypair.secret_bytes();
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(conversation_id.as_str().as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    ConversationKey(okm)
}

/// Seal plaintext for a conversation.
///
/// Returns the ciphertext (with authentication tag) and the [`CipherMeta`]
/// needed to open it. A random nonce is generated per call.
pub fn seal(
    plaintext: &[u8],
    key: &ConversationKey,
    sender: &DeviceKeyPair,
) -> SyncResult<(Vec<u8>, CipherMeta)> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

    let meta = CipherMeta {
        algorithm: ALGORITHM.to_string(),
        nonce: hex::encode(nonce_bytes),
        sender_device_id: sender.device_id().clone(),
    };

    Ok((ciphertext, meta))
}

/// Open sealed ciphertext with the given conversation key.
///
/// Fails with [`SyncError::Decryption`] on key/meta mismatch, e.g. a
/// message from a device whose key material we do not hold.
pub fn open(ciphertext: &[u8], meta: &CipherMeta, key: &ConversationKey) -> SyncResult<Vec<u8>> {
    if meta.algorithm != ALGORITHM {
        return Err(SyncError::Decryption(format!(
            "unsupported algorithm: {}",
            meta.algorithm
        )));
    }

    let nonce_bytes = hex::decode(&meta.nonce)
        .map_err(|e| SyncError::Decryption(format!("malformed nonce: {}", e)))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(SyncError::Decryption(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|e| SyncError::Decryption(format!("{}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    fn test_keypair(device: &str) -> DeviceKeyPair {
        DeviceKeyPair::generate(DeviceId::from_string(device))
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let keypair = test_keypair("d1");
        let conv = ConversationId::from_string("c1");

        let key1 = derive_conversation_key(&conv, &keypair);
        let key2 = derive_conversation_key(&conv, &keypair);
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derivation_varies_by_conversation() {
        let keypair = test_keypair("d1");
        let key1 = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);
        let key2 = derive_conversation_key(&ConversationId::from_string("c2"), &keypair);
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derivation_varies_by_device() {
        let conv = ConversationId::from_string("c1");
        let key1 = derive_conversation_key(&conv, &test_keypair("d1"));
        let key2 = derive_conversation_key(&conv, &test_keypair("d2"));
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let keypair = test_keypair("d1");
        let conv = ConversationId::from_string("c1");
        let key = derive_conversation_key(&conv, &keypair);

        let (ciphertext, meta) = seal(b"Hello, World!", &key, &keypair).unwrap();
        let plaintext = open(&ciphertext, &meta, &key).unwrap();
        assert_eq!(plaintext, b"Hello, World!");
        assert_eq!(meta.sender_device_id, *keypair.device_id());
    }

    #[test]
    fn test_roundtrip_after_rederivation() {
        // Same as seal/open across an app restart: the key is re-derived,
        // not stored.
        let keypair = test_keypair("d1");
        let conv = ConversationId::from_string("c1");

        let (ciphertext, meta) = seal(
            b"persisted",
            &derive_conversation_key(&conv, &keypair),
            &keypair,
        )
        .unwrap();

        let rederived = derive_conversation_key(&conv, &keypair);
        assert_eq!(open(&ciphertext, &meta, &rederived).unwrap(), b"persisted");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let keypair = test_keypair("d1");
        let key = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);

        let (c1, m1) = seal(b"repeat", &key, &keypair).unwrap();
        let (c2, m2) = seal(b"repeat", &key, &keypair).unwrap();
        assert_ne!(c1, c2);
        assert_ne!(m1.nonce, m2.nonce);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sender = test_keypair("d1");
        let conv = ConversationId::from_string("c1");
        let key = derive_conversation_key(&conv, &sender);
        let (ciphertext, meta) = seal(b"secret", &key, &sender).unwrap();

        let other_key = derive_conversation_key(&conv, &test_keypair("d2"));
        let result = open(&ciphertext, &meta, &other_key);
        assert!(matches!(result, Err(SyncError::Decryption(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keypair = test_keypair("d1");
        let key = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);
        let (mut ciphertext, meta) = seal(b"original", &key, &keypair).unwrap();

        ciphertext[0] ^= 0xFF;
        assert!(open(&ciphertext, &meta, &key).is_err());
    }

    #[test]
    fn test_unknown_algorithm_fails() {
        let keypair = test_keypair("d1");
        let key = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);
        let (ciphertext, mut meta) = seal(b"data", &key, &keypair).unwrap();

        meta.algorithm = "rot13".to_string();
        let result = open(&ciphertext, &meta, &key);
        assert!(matches!(result, Err(SyncError::Decryption(_))));
    }

    #[test]
    fn test_malformed_nonce_fails() {
        let keypair = test_keypair("d1");
        let key = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);
        let (ciphertext, mut meta) = seal(b"data", &key, &keypair).unwrap();

        meta.nonce = "zz".to_string();
        assert!(open(&ciphertext, &meta, &key).is_err());

        meta.nonce = "0011".to_string();
        assert!(open(&ciphertext, &meta, &key).is_err());
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let keypair = test_keypair("d1");
        let key = derive_conversation_key(&ConversationId::from_string("c1"), &keypair);
        let (ciphertext, meta) = seal(b"", &key, &keypair).unwrap();
        assert_eq!(open(&ciphertext, &meta, &key).unwrap(), b"");
    }
}
