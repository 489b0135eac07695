//! Capability validation with a per-file cache of verified capabilities.
//!
//! Capabilities are minted by the metadata service and only checked here.
//! Verifying a signature is the expensive part, so a capability that passed
//! once is remembered until the file is closed. A hit must equal the presented
//! token in every field; sharing a signature is not enough.
//! Expiry is re-checked on every use, cached or not.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bitflags::bitflags;
use lru::LruCache;
use osd_lease::lease::FileCredentials;
use sha2::{Digest, Sha256};

use crate::error::{CapabilityError, OsdError};
use crate::request::FileId;

bitflags! {
    /// POSIX-style open flags carried by a capability.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessMode: u32 {
        const WRONLY = 0x1;
        const RDWR = 0x2;
        const APPEND = 0x8;
        const CREAT = 0x100;
        const TRUNC = 0x200;
        const EXCL = 0x400;
    }
}

impl AccessMode {
    pub const RDONLY: Self = Self::empty();

    /// Any flag that lets the holder modify file contents.
    pub fn writes(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR | Self::TRUNC)
    }
}

/// Operation class a capability is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procedure {
    Read,
    Write,
    Truncate,
    Delete,
    Lock,
    ReplicaMaintenance,
}

impl Procedure {
    pub fn permits(self, mode: AccessMode) -> bool {
        match self {
            Self::Read => !mode.contains(AccessMode::WRONLY),
            Self::Write => mode.intersects(AccessMode::WRONLY | AccessMode::RDWR),
            Self::Truncate => mode.writes(),
            Self::Delete => mode.contains(AccessMode::RDWR),
            Self::Lock | Self::ReplicaMaintenance => true,
        }
    }
}

/// Signed, time-limited access grant for one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub subject: String,
    pub file_id: String,
    pub access_mode: AccessMode,
    /// Unix millis after which the capability is no longer valid.
    pub expires_ms: u64,
    pub epoch: i64,
    pub priority: u32,
    pub snapshots_enabled: bool,
    pub signature: String,
}

impl Capability {
    pub fn has_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_ms
    }

    /// The holder may create a new file version on close.
    pub fn opens_for_write(&self) -> bool {
        self.snapshots_enabled && self.access_mode.writes()
    }

    pub fn credentials(&self) -> FileCredentials {
        FileCredentials {
            subject: self.subject.clone(),
            signature: self.signature.clone(),
        }
    }
}

pub trait SignatureVerifier: Send + Sync + 'static {
    fn verify(&self, capability: &Capability) -> bool;
}

/// HMAC-style SHA-256 signatures over the capability fields and a shared secret.
pub struct Sha256Signer {
    secret: Vec<u8>,
}

impl Sha256Signer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn signature_for(&self, capability: &Capability) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(capability.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(capability.file_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(capability.access_mode.bits().to_be_bytes());
        hasher.update(capability.expires_ms.to_be_bytes());
        hasher.update(capability.epoch.to_be_bytes());
        hasher.update(capability.priority.to_be_bytes());
        hasher.update([capability.snapshots_enabled as u8]);
        hex::encode(hasher.finalize())
    }

    pub fn sign(&self, mut capability: Capability) -> Capability {
        capability.signature = self.signature_for(&capability);
        capability
    }
}

impl SignatureVerifier for Sha256Signer {
    fn verify(&self, capability: &Capability) -> bool {
        self.signature_for(capability) == capability.signature
    }
}

pub struct CapabilityValidator {
    verifier: Arc<dyn SignatureVerifier>,
    per_file: NonZeroUsize,
    ignore: bool,
    cache: HashMap<String, LruCache<String, Capability>>,
}

impl CapabilityValidator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, per_file: usize, ignore: bool) -> Self {
        Self {
            verifier,
            per_file: NonZeroUsize::new(per_file).unwrap_or(NonZeroUsize::MIN),
            ignore,
            cache: HashMap::new(),
        }
    }

    /// Validation is switched off (benchmarks and trusted test setups).
    pub fn ignores_capabilities(&self) -> bool {
        self.ignore
    }

    pub fn validate(
        &mut self,
        capability: &Capability,
        file_id: &FileId,
        procedure: Procedure,
        now_ms: u64,
    ) -> Result<(), OsdError> {
        if file_id.is_empty() || capability.file_id.is_empty() {
            return Err(OsdError::InvalidArgument(
                "file id must not be empty".to_string(),
            ));
        }
        if capability.epoch < 0 {
            return Err(OsdError::InvalidArgument(format!(
                "invalid capability epoch {}",
                capability.epoch
            )));
        }
        if self.ignore {
            return Ok(());
        }

        // A hit must be the very token that was verified, not just its signature.
        let cached = self
            .cache
            .get_mut(file_id.as_str())
            .and_then(|caps| caps.get(&capability.signature))
            .filter(|cap| *cap == capability)
            .map(|cap| cap.has_expired(now_ms));
        match cached {
            Some(false) => {}
            Some(true) => {
                if let Some(caps) = self.cache.get_mut(file_id.as_str()) {
                    caps.pop(&capability.signature);
                }
                return Err(CapabilityError::Expired.into());
            }
            None => {
                if capability.has_expired(now_ms) {
                    return Err(CapabilityError::Expired.into());
                }
                if !self.verifier.verify(capability) {
                    return Err(CapabilityError::BadSignature.into());
                }
                if capability.file_id != file_id.as_str() {
                    return Err(CapabilityError::WrongFile.into());
                }
                let per_file = self.per_file;
                self.cache
                    .entry(capability.file_id.clone())
                    .or_insert_with(|| LruCache::new(per_file))
                    .put(capability.signature.clone(), capability.clone());
            }
        }

        if !procedure.permits(capability.access_mode) {
            return Err(CapabilityError::InsufficientMode.into());
        }
        Ok(())
    }

    /// Drop every cached capability of a closed file.
    pub fn forget_file(&mut self, file_id: &FileId) -> usize {
        self.cache
            .remove(file_id.as_str())
            .map_or(0, |caps| caps.len())
    }

    /// Keep cached capabilities only for files `keep` accepts. Returns how many were dropped.
    pub fn retain_files(&mut self, mut keep: impl FnMut(&FileId) -> bool) -> usize {
        let mut dropped = 0;
        self.cache.retain(|file_id, caps| {
            let kept = keep(&FileId::new(file_id.as_str()));
            if !kept {
                dropped += caps.len();
            }
            kept
        });
        dropped
    }

    pub fn cached(&self, file_id: &FileId) -> usize {
        self.cache.get(file_id.as_str()).map_or(0, LruCache::len)
    }
}
