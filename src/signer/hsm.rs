//! HSM capability
//!
//! The signer never touches private keys directly. It talks to an [`Hsm`],
//! from which every worker and drudger thread lazily creates its own
//! [`HsmContext`]; contexts are never shared between threads.
//!
//! [`SoftHsm`] is a file-backed implementation on top of `ring`: each key is
//! a JSON file `<locator>.json` in the key directory holding a PKCS#8 key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING, ED25519,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::HsmError;
use crate::signer::keys::Algorithm;

/// Opaque reference to a key inside one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    pub locator: String,
    pub algorithm: u8,
}

/// Shared HSM session.
pub trait Hsm: Send + Sync {
    fn open(&self) -> Result<(), HsmError>;
    fn close(&self);
    /// Close and open again after a context failure.
    fn reopen(&self) -> Result<(), HsmError> {
        self.close();
        self.open()
    }
    fn create_context(&self) -> Result<Box<dyn HsmContext>, HsmError>;
}

/// Per-thread signing context.
pub trait HsmContext: Send {
    fn find_key(&mut self, locator: &str) -> Result<KeyHandle, HsmError>;
    /// DNSKEY public key field for the key.
    fn public_key(&mut self, key: &KeyHandle) -> Result<Vec<u8>, HsmError>;
    fn sign(&mut self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError>;
    /// Health check; an error means the context must be dropped.
    fn check(&self) -> Result<(), HsmError>;
}

/// Stored key file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyFile {
    locator: String,
    algorithm: u8,
    /// PKCS#8 document, hex.
    pkcs8: String,
    created_at: u64,
}

enum LoadedKey {
    Ed25519(Ed25519KeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl LoadedKey {
    fn from_file(file: &KeyFile) -> Result<Self, HsmError> {
        let pkcs8 = hex::decode(&file.pkcs8)
            .map_err(|e| HsmError::Storage(format!("{}: {}", file.locator, e)))?;
        match Algorithm::from_number(file.algorithm) {
            Some(Algorithm::Ed25519) => Ed25519KeyPair::from_pkcs8(&pkcs8)
                .map(LoadedKey::Ed25519)
                .map_err(|_| HsmError::Storage(format!("invalid Ed25519 key {}", file.locator))),
            Some(Algorithm::EcdsaP256Sha256) => EcdsaKeyPair::from_pkcs8(
                &ECDSA_P256_SHA256_FIXED_SIGNING,
                &pkcs8,
                &SystemRandom::new(),
            )
            .map(LoadedKey::Ecdsa)
            .map_err(|_| HsmError::Storage(format!("invalid ECDSA key {}", file.locator))),
            None => Err(HsmError::UnsupportedAlgorithm(file.algorithm)),
        }
    }

    fn dnskey_public_key(&self) -> Vec<u8> {
        match self {
            LoadedKey::Ed25519(pair) => pair.public_key().as_ref().to_vec(),
            // DNSKEY carries the bare X || Y point (RFC 6605), without the
            // uncompressed-point prefix byte.
            LoadedKey::Ecdsa(pair) => pair.public_key().as_ref()[1..].to_vec(),
        }
    }
}

/// File-backed software HSM.
pub struct SoftHsm {
    key_dir: PathBuf,
    open: AtomicBool,
}

impl SoftHsm {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            open: AtomicBool::new(false),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Generate a key, store it, and return its locator.
    pub fn generate_key(&self, algorithm: Algorithm) -> Result<String, HsmError> {
        let rng = SystemRandom::new();
        let pkcs8 = match algorithm {
            Algorithm::Ed25519 => Ed25519KeyPair::generate_pkcs8(&rng)
                .map_err(|_| HsmError::Storage("Ed25519 key generation failed".to_string()))?
                .as_ref()
                .to_vec(),
            Algorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| HsmError::Storage("ECDSA key generation failed".to_string()))?
                    .as_ref()
                    .to_vec()
            }
        };

        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let locator = hex::encode(id);

        let file = KeyFile {
            locator: locator.clone(),
            algorithm: algorithm.number(),
            pkcs8: hex::encode(pkcs8),
            created_at: crate::current_timestamp(),
        };
        fs::create_dir_all(&self.key_dir).map_err(|e| HsmError::Storage(e.to_string()))?;
        let json =
            serde_json::to_string_pretty(&file).map_err(|e| HsmError::Storage(e.to_string()))?;
        fs::write(self.key_path(&locator), json).map_err(|e| HsmError::Storage(e.to_string()))?;

        info!(
            "Generated {} key {} in {}",
            algorithm.name(),
            locator,
            self.key_dir.display()
        );
        Ok(locator)
    }

    fn key_path(&self, locator: &str) -> PathBuf {
        self.key_dir.join(format!("{}.json", locator))
    }
}

impl Hsm for SoftHsm {
    fn open(&self) -> Result<(), HsmError> {
        if !self.key_dir.is_dir() {
            return Err(HsmError::ContextCreation(format!(
                "key directory {} does not exist",
                self.key_dir.display()
            )));
        }
        self.open.store(true, Ordering::SeqCst);
        debug!("Soft HSM opened at {}", self.key_dir.display());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn create_context(&self) -> Result<Box<dyn HsmContext>, HsmError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(HsmError::Closed);
        }
        Ok(Box::new(SoftContext {
            key_dir: self.key_dir.clone(),
            keys: HashMap::new(),
            rng: SystemRandom::new(),
        }))
    }
}

struct SoftContext {
    key_dir: PathBuf,
    keys: HashMap<String, Arc<LoadedKey>>,
    rng: SystemRandom,
}

impl SoftContext {
    fn loaded(&self, key: &KeyHandle) -> Result<&Arc<LoadedKey>, HsmError> {
        self.keys
            .get(&key.locator)
            .ok_or_else(|| HsmError::KeyNotFound(key.locator.clone()))
    }
}

impl HsmContext for SoftContext {
    fn find_key(&mut self, locator: &str) -> Result<KeyHandle, HsmError> {
        if let Some(loaded) = self.keys.get(locator) {
            let algorithm = match **loaded {
                LoadedKey::Ed25519(_) => Algorithm::Ed25519.number(),
                LoadedKey::Ecdsa(_) => Algorithm::EcdsaP256Sha256.number(),
            };
            return Ok(KeyHandle {
                locator: locator.to_string(),
                algorithm,
            });
        }

        let path = self.key_dir.join(format!("{}.json", locator));
        let json = fs::read_to_string(&path).map_err(|_| HsmError::KeyNotFound(locator.to_string()))?;
        let file: KeyFile =
            serde_json::from_str(&json).map_err(|e| HsmError::Storage(format!("{}: {}", locator, e)))?;
        let loaded = LoadedKey::from_file(&file)?;
        self.keys.insert(locator.to_string(), Arc::new(loaded));
        debug!("Loaded key {} from {}", locator, path.display());

        Ok(KeyHandle {
            locator: locator.to_string(),
            algorithm: file.algorithm,
        })
    }

    fn public_key(&mut self, key: &KeyHandle) -> Result<Vec<u8>, HsmError> {
        Ok(self.loaded(key)?.dnskey_public_key())
    }

    fn sign(&mut self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        match &**self.loaded(key)? {
            LoadedKey::Ed25519(pair) => Ok(pair.sign(data).as_ref().to_vec()),
            LoadedKey::Ecdsa(pair) => pair
                .sign(&self.rng, data)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| HsmError::Signing(key.locator.clone())),
        }
    }

    fn check(&self) -> Result<(), HsmError> {
        if self.key_dir.is_dir() {
            Ok(())
        } else {
            warn!("Soft HSM key directory {} vanished", self.key_dir.display());
            Err(HsmError::ContextCreation(format!(
                "key directory {} vanished",
                self.key_dir.display()
            )))
        }
    }
}

/// Verify a DNSSEC signature against a DNSKEY public key field.
pub fn verify_signature(algorithm: u8, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    match Algorithm::from_number(algorithm) {
        Some(Algorithm::Ed25519) => UnparsedPublicKey::new(&ED25519, public_key)
            .verify(data, signature)
            .is_ok(),
        Some(Algorithm::EcdsaP256Sha256) => {
            let mut point = Vec::with_capacity(public_key.len() + 1);
            point.push(0x04);
            point.extend_from_slice(public_key);
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point)
                .verify(data, signature)
                .is_ok()
        }
        None => false,
    }
}
