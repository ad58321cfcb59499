//! Key material for the local agent.
//!
//! # Algorithms
//!
//! - **Key Generation**: Ed25519
//! - **Identifier**: `did:key` (multicodec `0xed01` + base58btc)
//! - **Key Derivation**: Argon2id, cost taken from [`KdfParams`]
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)

use crate::config::KdfParams;
use crate::error::{CoreError, Result};
use ad4m_types::{Expression, ExpressionProof};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Ed25519 private key length (32 bytes)
pub const PRIVATE_KEY_LEN: usize = 32;

/// Multicodec prefix of an ed25519 public key
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

const DID_KEY_PREFIX: &str = "did:key:z";

pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// `did:key` identifier for an ed25519 public key.
pub fn did_for_key(key: &VerifyingKey) -> String {
    let mut bytes = Vec::with_capacity(2 + key.as_bytes().len());
    bytes.extend_from_slice(&ED25519_MULTICODEC);
    bytes.extend_from_slice(key.as_bytes());
    format!("{DID_KEY_PREFIX}{}", bs58::encode(bytes).into_string())
}

/// Public key encoded in a `did:key` identifier, if it is one.
pub fn key_for_did(did: &str) -> Option<VerifyingKey> {
    let encoded = did.strip_prefix(DID_KEY_PREFIX)?;
    let bytes = bs58::decode(encoded).into_vec().ok()?;
    let key = bytes.strip_prefix(&ED25519_MULTICODEC[..])?;
    let key: [u8; 32] = key.try_into().ok()?;
    VerifyingKey::from_bytes(&key).ok()
}

/// Derive a 256-bit key encryption key from a passphrase.
pub fn derive_key_encryption_key(
    passphrase: &[u8],
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| CoreError::Crypto(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| CoreError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

pub fn encrypt_private_key(
    private_key: &[u8; PRIVATE_KEY_LEN],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    cipher
        .encrypt(Nonce::from_slice(nonce), private_key.as_slice())
        .map_err(|e| CoreError::Crypto(format!("encryption failed: {e}")))
}

/// Decrypt a sealed private key.
///
/// Any failure, whether a wrong key or a tampered blob, is reported as
/// [`CoreError::AuthenticationFailed`].
pub fn decrypt_private_key(
    ciphertext: &[u8],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Zeroizing<[u8; PRIVATE_KEY_LEN]>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::AuthenticationFailed)?,
    );
    if plaintext.len() != PRIVATE_KEY_LEN {
        return Err(CoreError::AuthenticationFailed);
    }

    let mut key = Zeroizing::new([0u8; PRIVATE_KEY_LEN]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// A private key encrypted under a passphrase, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// hex
    pub salt: String,
    /// hex
    pub nonce: String,
    /// hex, key plus auth tag
    pub ciphertext: String,
    pub kdf: KdfParams,
}

impl SealedKey {
    /// Encrypt `key` under `passphrase` with a fresh salt and nonce.
    pub fn seal(key: &SigningKey, passphrase: &str, kdf: KdfParams) -> Result<Self> {
        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let kek = derive_key_encryption_key(passphrase.as_bytes(), &salt, &kdf)?;
        let private_key = Zeroizing::new(key.to_bytes());
        let ciphertext = encrypt_private_key(&private_key, &kek, &nonce)?;

        Ok(Self {
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
            kdf,
        })
    }

    pub fn open(&self, passphrase: &str) -> Result<SigningKey> {
        let salt = hex::decode(&self.salt).map_err(|_| CoreError::AuthenticationFailed)?;
        let nonce: [u8; NONCE_LEN] = hex::decode(&self.nonce)
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or(CoreError::AuthenticationFailed)?;
        let ciphertext = hex::decode(&self.ciphertext).map_err(|_| CoreError::AuthenticationFailed)?;

        let kek = derive_key_encryption_key(passphrase.as_bytes(), &salt, &self.kdf)?;
        let private_key = decrypt_private_key(&ciphertext, &kek, &nonce)?;
        Ok(SigningKey::from_bytes(&private_key))
    }
}

pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> ExpressionProof {
    let signature: Signature = signing_key.sign(payload);
    ExpressionProof {
        key: hex::encode(signing_key.verifying_key().as_bytes()),
        signature: hex::encode(signature.to_bytes()),
        valid: None,
    }
}

/// Check an expression's proof.
///
/// The signature must verify against the proof key, and for `did:key`
/// authors the proof key must be the author's key.
pub fn verify_expression(expression: &Expression) -> bool {
    let Some(key) = hex::decode(&expression.proof.key)
        .ok()
        .and_then(|k| <[u8; 32]>::try_from(k).ok())
        .and_then(|k| VerifyingKey::from_bytes(&k).ok())
    else {
        return false;
    };
    let Some(signature) = hex::decode(&expression.proof.signature)
        .ok()
        .and_then(|s| <[u8; 64]>::try_from(s).ok())
        .map(|s| Signature::from_bytes(&s))
    else {
        return false;
    };

    if expression.author.starts_with(DID_KEY_PREFIX) && key_for_did(&expression.author) != Some(key) {
        return false;
    }
    key.verify(&expression.payload(), &signature).is_ok()
}
