// src/crypto/mod.rs
//! End-to-end encryption service
//!
//! One key pair per process: an X25519 secret for key agreement and an
//! Ed25519 key for signatures. Peers exchange public keys as a PEM block
//! (`PARLEY PUBLIC KEY`) holding both 32-byte public halves.
//!
//! The private half stays in memory unless a [`KeyStore`] is supplied.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::{debug, error, info, warn};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};

pub mod container;
pub mod primitives;

/// PEM label for exported public keys
pub const PUBLIC_KEY_LABEL: &str = "PARLEY PUBLIC KEY";

const SECRET_MATERIAL_LEN: usize = 64;

/// Pluggable storage for the private key material
pub trait KeyStore: Send + Sync {
    /// Load previously stored secret material, if any
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>>;

    /// Persist secret material, replacing what was there
    fn store(&self, secret: &[u8]) -> Result<()>;
}

/// Keeps the secret material in a single file (owner read/write only on Unix).
///
/// The file is not encrypted; use an OS keystore implementation where that matters.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(fs::read(&self.path)?)))
    }

    fn store(&self, secret: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, secret)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

struct KeyPair {
    exchange: StaticSecret,
    signing: SigningKey,
}

impl KeyPair {
    fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        Self {
            exchange: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::from_bytes(&seed),
        }
    }

    fn from_material(material: &[u8]) -> Result<Self> {
        if material.len() != SECRET_MATERIAL_LEN {
            return Err(CoreError::Encryption(format!(
                "Stored key material has {} bytes, expected {}",
                material.len(),
                SECRET_MATERIAL_LEN
            )));
        }
        let mut exchange = Zeroizing::new([0u8; 32]);
        exchange.copy_from_slice(&material[..32]);
        let mut signing = Zeroizing::new([0u8; 32]);
        signing.copy_from_slice(&material[32..]);

        Ok(Self {
            exchange: StaticSecret::from(*exchange),
            signing: SigningKey::from_bytes(&signing),
        })
    }

    fn to_material(&self) -> Zeroizing<Vec<u8>> {
        let mut material = Zeroizing::new(Vec::with_capacity(SECRET_MATERIAL_LEN));
        material.extend_from_slice(&self.exchange.to_bytes());
        material.extend_from_slice(&self.signing.to_bytes());
        material
    }

    fn public(&self) -> PeerPublicKey {
        PeerPublicKey {
            exchange: PublicKey::from(&self.exchange),
            verifying: self.signing.verifying_key(),
        }
    }
}

/// A peer's imported public key
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPublicKey {
    exchange: PublicKey,
    verifying: VerifyingKey,
}

impl PeerPublicKey {
    /// Parse the PEM text produced by [`CryptoService::get_public_key`]
    pub fn from_pem(text: &str) -> Result<Self> {
        let block = pem::parse(text)
            .map_err(|e| CoreError::Encryption(format!("Invalid public key PEM: {}", e)))?;
        if block.tag() != PUBLIC_KEY_LABEL {
            return Err(CoreError::Encryption(format!("Unexpected PEM label '{}'", block.tag())));
        }
        Self::from_bytes(block.contents())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(CoreError::Encryption(format!("Public key has {} bytes, expected 64", bytes.len())));
        }
        let mut exchange = [0u8; 32];
        exchange.copy_from_slice(&bytes[..32]);
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[32..]);

        let verifying = VerifyingKey::from_bytes(&verifying)
            .map_err(|e| CoreError::Encryption(format!("Invalid signature key: {}", e)))?;
        Ok(Self { exchange: PublicKey::from(exchange), verifying })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.exchange.as_bytes());
        bytes.extend_from_slice(self.verifying.as_bytes());
        bytes
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PUBLIC_KEY_LABEL, self.to_bytes()))
    }

    /// Raw X25519 half, used to seal payloads for this peer
    pub fn exchange_key(&self) -> &[u8; 32] {
        self.exchange.as_bytes()
    }

    /// SHA-256 fingerprint for out-of-band comparison
    pub fn fingerprint(&self) -> String {
        primitives::format_fingerprint(&primitives::sha256_hash(&self.to_bytes()))
    }
}

/// Key management, hybrid encryption and signatures
pub struct CryptoService {
    keys: RwLock<Option<KeyPair>>,
    key_store: Option<Box<dyn KeyStore>>,
}

impl Default for CryptoService {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoService {
    /// Service with no key yet and no persistence
    pub fn new() -> Self {
        Self { keys: RwLock::new(None), key_store: None }
    }

    /// Service backed by a key store; a stored key pair is loaded immediately
    pub fn with_key_store(store: Box<dyn KeyStore>) -> Result<Self> {
        let keys = match store.load()? {
            Some(material) => {
                info!("Loaded key pair from key store");
                Some(KeyPair::from_material(&material)?)
            }
            None => None,
        };
        Ok(Self { keys: RwLock::new(keys), key_store: Some(store) })
    }

    fn read_keys(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<KeyPair>>> {
        self.keys
            .read()
            .map_err(|_| CoreError::Unknown("key lock poisoned".to_string()))
    }

    /// Whether a key pair is loaded
    pub fn has_key_pair(&self) -> bool {
        self.read_keys().map(|k| k.is_some()).unwrap_or(false)
    }

    /// Create a fresh key pair, replacing any existing one
    pub fn generate_key_pair(&self) -> Result<()> {
        let pair = KeyPair::generate();
        if let Some(store) = &self.key_store {
            store.store(&pair.to_material())?;
        }
        let fingerprint = pair.public().fingerprint();

        let mut keys = self
            .keys
            .write()
            .map_err(|_| CoreError::Unknown("key lock poisoned".to_string()))?;
        *keys = Some(pair);
        info!("Generated new key pair, fingerprint {}", fingerprint);
        Ok(())
    }

    /// Generate a key pair only if none is loaded
    pub fn ensure_key_pair(&self) -> Result<()> {
        if self.has_key_pair() {
            return Ok(());
        }
        self.generate_key_pair()
    }

    fn public_key(&self) -> Result<PeerPublicKey> {
        let keys = self.read_keys()?;
        keys.as_ref()
            .map(KeyPair::public)
            .ok_or_else(|| CoreError::Encryption("No key pair generated".to_string()))
    }

    /// Export the local public key as PEM text
    pub fn get_public_key(&self) -> Result<String> {
        Ok(self.public_key()?.to_pem())
    }

    /// Validate and parse a peer's PEM public key
    pub fn import_public_key(&self, pem_text: &str) -> Result<PeerPublicKey> {
        let key = PeerPublicKey::from_pem(pem_text)?;
        debug!("Imported public key {}", key.fingerprint());
        Ok(key)
    }

    /// Fingerprint of the local public key
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.public_key()?.fingerprint())
    }

    /// Encrypt `plaintext` for the owner of `recipient_public_key` (PEM)
    pub fn encrypt_message(&self, plaintext: &[u8], recipient_public_key: &str) -> Result<Vec<u8>> {
        let recipient = PeerPublicKey::from_pem(recipient_public_key)?;
        Ok(primitives::seal(recipient.exchange_key(), plaintext)?)
    }

    /// Decrypt a message sealed to the local key pair
    pub fn decrypt_message(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.read_keys()?;
        let pair = keys
            .as_ref()
            .ok_or_else(|| CoreError::Encryption("No key pair generated".to_string()))?;
        primitives::open(&pair.exchange, ciphertext).map_err(|e| {
            warn!("Failed to decrypt message: {}", e);
            CoreError::from(e)
        })
    }

    /// Encrypt a file into the container format for `recipient_public_key`.
    ///
    /// Returns the number of plaintext bytes encrypted.
    pub fn encrypt_file(&self, input: &Path, output: &Path, recipient_public_key: &str) -> Result<u64> {
        let recipient = PeerPublicKey::from_pem(recipient_public_key)?;
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);

        let total = container::encrypt_stream(&mut reader, &mut writer, recipient.exchange_key())
            .map_err(|e| {
                error!("Failed to encrypt {}: {}", input.display(), e);
                let _ = fs::remove_file(output);
                CoreError::from(e)
            })?;
        info!("Encrypted {} ({} bytes) to {}", input.display(), total, output.display());
        Ok(total)
    }

    /// Decrypt a container produced by [`encrypt_file`](Self::encrypt_file).
    ///
    /// A partially written output is removed on failure.
    pub fn decrypt_file(&self, input: &Path, output: &Path) -> Result<u64> {
        let keys = self.read_keys()?;
        let pair = keys
            .as_ref()
            .ok_or_else(|| CoreError::Encryption("No key pair generated".to_string()))?;

        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);

        let result = container::decrypt_stream(&mut reader, &mut writer, &pair.exchange);
        drop(writer);
        match result {
            Ok(total) => {
                info!("Decrypted {} ({} bytes) to {}", input.display(), total, output.display());
                Ok(total)
            }
            Err(e) => {
                error!("Failed to decrypt {}: {}", input.display(), e);
                let _ = fs::remove_file(output);
                Err(e.into())
            }
        }
    }

    /// Ed25519 signature over the message bytes
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let keys = self.read_keys()?;
        let pair = keys
            .as_ref()
            .ok_or_else(|| CoreError::Encryption("No key pair generated".to_string()))?;
        Ok(pair.signing.sign(message).to_bytes().to_vec())
    }

    /// Check a signature against the signer's PEM public key.
    ///
    /// Malformed signatures verify as false; a malformed key is an error.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8], public_key: &str) -> Result<bool> {
        let signer = PeerPublicKey::from_pem(public_key)?;
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(signer.verifying.verify(message, &signature).is_ok())
    }

    /// Open a sealed box with the local X25519 secret
    pub(crate) fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_message(sealed)
    }
}
