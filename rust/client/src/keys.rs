//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The master key and the keys domain-separated from it.

use core::fmt;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;

use crate::error::{Error, Result};

pub const MASTER_KEY_LEN: usize = 32;

/// Root secret for everything the account encrypts.
///
/// Minted once, replaced atomically on rotation, and never mutated in place.
#[derive(Clone, Eq, PartialEq)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; MASTER_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::assert(format!("master key must be {MASTER_KEY_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }
}

impl From<[u8; MASTER_KEY_LEN]> for MasterKey {
    fn from(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(redacted)")
    }
}

/// A use-specific key expanded from a parent by domain separation.
///
/// Every variant is `HMAC-SHA-256(parent, label)`. The storage service keys
/// form a two-level tree: manifest and record keys hang off the storage
/// service key, which in turn hangs off the master key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DerivedKey {
    /// Proves ownership of the account during re-registration.
    RegistrationLock,
    /// Encrypts the storage service.
    StorageService,
    /// Encrypts one version of the storage service manifest.
    StorageServiceManifest(u64),
    /// Encrypts one storage service record.
    StorageServiceRecord(Vec<u8>),
}

impl DerivedKey {
    /// Keys a linked device may receive over the sync channel. Everything
    /// else is derivable on demand from a key that is.
    pub const SYNCABLE: &'static [DerivedKey] = &[DerivedKey::StorageService];

    /// The domain separation label, also used as the persistence key for
    /// synced copies.
    pub fn label(&self) -> String {
        match self {
            Self::RegistrationLock => "Registration Lock".to_string(),
            Self::StorageService => "Storage Service Encryption".to_string(),
            Self::StorageServiceManifest(version) => format!("Manifest_{version}"),
            Self::StorageServiceRecord(id) => format!("Item_{}", BASE64_STANDARD.encode(id)),
        }
    }

    /// The key this one is derived from, or `None` for keys that hang off
    /// the master key directly.
    pub fn parent(&self) -> Option<DerivedKey> {
        match self {
            Self::RegistrationLock | Self::StorageService => None,
            Self::StorageServiceManifest(_) | Self::StorageServiceRecord(_) => {
                Some(Self::StorageService)
            }
        }
    }

    pub fn is_syncable(&self) -> bool {
        Self::SYNCABLE.contains(self)
    }
}

/// One step of the derivation tree.
pub fn derive_named(parent: &[u8], label: &str) -> [u8; 32] {
    hmac_sha256(parent, label.as_bytes())
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
