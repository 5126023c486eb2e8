// src/crypto/primitives.rs
//! Low-level cryptographic building blocks
//!
//! AES-256-GCM, HKDF-SHA256 and X25519 sealed boxes. Everything above this
//! module (message encryption, the file container, transfer payloads) is
//! composed from these functions.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use log::{error, trace};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Errors related to cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Error during AES-GCM encryption or decryption
    #[error("AES-GCM error: {0}")]
    AesGcmError(String),

    /// Error during KDF derivation
    #[error("KDF error: {0}")]
    KdfError(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInputError(String),

    /// Key agreement produced a non-contributory secret
    #[error("Key agreement error: {0}")]
    KeyAgreementError(String),

    /// Invalid IV
    #[error("Invalid IV: {0}")]
    InvalidIV(String),
}

/// The size of the AES key in bytes (256 bits)
pub const AES_KEY_SIZE: usize = 32;

/// The size of the IV in bytes for AES-GCM (96 bits)
pub const AES_IV_SIZE: usize = 12;

/// The size of the GCM authentication tag
pub const AES_TAG_SIZE: usize = 16;

/// Size of an X25519 public key
pub const X25519_KEY_SIZE: usize = 32;

/// Overhead a sealed box adds to its plaintext
pub const SEALED_BOX_OVERHEAD: usize = X25519_KEY_SIZE + AES_IV_SIZE + AES_TAG_SIZE;

const SEAL_INFO: &[u8] = b"parley sealed box v1";

/// Generate a random initialization vector for AES-GCM
pub fn generate_iv() -> [u8; AES_IV_SIZE] {
    let mut iv = [0u8; AES_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    trace!("Generated IV: {}", hex::encode(iv));
    iv
}

/// Generate a random 256-bit symmetric key
pub fn generate_symmetric_key() -> Zeroizing<[u8; AES_KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Validate an AES-GCM initialization vector (IV)
pub fn validate_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != AES_IV_SIZE {
        error!("Invalid IV length: {} (expected {} bytes)", iv.len(), AES_IV_SIZE);
        return Err(CryptoError::InvalidIV(format!(
            "Invalid IV length: {} (expected {} bytes)",
            iv.len(),
            AES_IV_SIZE
        )));
    }
    Ok(())
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_SIZE {
        error!("Invalid key size: {} (expected {} bytes)", key.len(), AES_KEY_SIZE);
        return Err(CryptoError::InvalidInputError(format!(
            "Invalid key size: {} (expected {} bytes)",
            key.len(),
            AES_KEY_SIZE
        )));
    }
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::AesGcmError(format!("Failed to create cipher: {}", e)))
}

/// Encrypt with AES-256-GCM; the returned ciphertext ends with the 16-byte tag
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    validate_iv(iv)?;
    let cipher = cipher_for(key)?;

    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad: associated_data })
        .map_err(|e| {
            error!("AES-GCM encryption failed: {}", e);
            CryptoError::AesGcmError(format!("Encryption failed: {}", e))
        })
}

/// Decrypt a message using AES-256-GCM, verifying the tag
pub fn decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    validate_iv(iv)?;
    let cipher = cipher_for(key)?;

    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad: associated_data })
        .map_err(|_| CryptoError::AesGcmError("Decryption failed: authentication tag mismatch".to_string()))
}

/// Derive a key using HKDF
pub fn hkdf_derive(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; output_len]);

    if let Err(e) = hk.expand(info, &mut okm) {
        error!("HKDF expansion failed: {}", e);
        return Err(CryptoError::KdfError(format!("HKDF expansion failed: {}", e)));
    }

    Ok(okm)
}

/// Calculate a SHA-256 hash
pub fn sha256_hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Format a fingerprint for display as colon-separated hex pairs
pub fn format_fingerprint(fingerprint: &[u8]) -> String {
    fingerprint
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn public_key_from_slice(key: &[u8]) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; X25519_KEY_SIZE] = key.try_into().map_err(|_| {
        CryptoError::InvalidInputError(format!("Invalid X25519 public key length: {}", key.len()))
    })?;
    Ok(PublicKey::from(bytes))
}

fn seal_key(
    secret: &StaticSecret,
    peer_public: &PublicKey,
    ephemeral_public: &[u8],
    recipient_public: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let shared = secret.diffie_hellman(peer_public);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreementError("low-order public key".to_string()));
    }

    let mut salt = Vec::with_capacity(X25519_KEY_SIZE * 2);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_public);
    hkdf_derive(&salt, shared.as_bytes(), SEAL_INFO, AES_KEY_SIZE)
}

/// Encrypt `plaintext` to the holder of the X25519 secret matching `recipient`.
///
/// Layout: `ephemeral public (32) || nonce (12) || ciphertext || tag (16)`.
pub fn seal(recipient: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient_key = public_key_from_slice(recipient)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let key = seal_key(&ephemeral, &recipient_key, ephemeral_public.as_bytes(), recipient)?;

    let iv = generate_iv();
    let ciphertext = encrypt(plaintext, &key, &iv, ephemeral_public.as_bytes())?;

    let mut out = Vec::with_capacity(SEALED_BOX_OVERHEAD + plaintext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed box produced by [`seal`] with the recipient's secret
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEALED_BOX_OVERHEAD {
        return Err(CryptoError::InvalidInputError(format!(
            "Sealed box too short: {} bytes",
            sealed.len()
        )));
    }

    let (ephemeral_bytes, rest) = sealed.split_at(X25519_KEY_SIZE);
    let (iv, ciphertext) = rest.split_at(AES_IV_SIZE);

    let ephemeral_public = public_key_from_slice(ephemeral_bytes)?;
    let own_public = PublicKey::from(secret);
    let key = seal_key(secret, &ephemeral_public, ephemeral_bytes, own_public.as_bytes())?;

    decrypt(ciphertext, &key, iv, ephemeral_bytes)
}

/// Build a GCM nonce from a 12-byte base and a counter (last 8 bytes XOR counter)
pub fn counter_nonce(base: &[u8; AES_IV_SIZE], counter: u64) -> [u8; AES_IV_SIZE] {
    let mut nonce = *base;
    for (slot, byte) in nonce[4..].iter_mut().zip(counter.to_be_bytes()) {
        *slot ^= byte;
    }
    nonce
}
