//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Durable storage for keys and the enclave token.
//!
//! [`KeyValueStore`] is the boundary to whatever database the application
//! embeds; [`KeyStore`] is the typed facade the service uses for its own
//! collection. Grouped writes go through a single batch so readers observe
//! either the pre-state or the post-state, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kbs_pin::PinType;

use crate::keys::{DerivedKey, MasterKey};

/// Failure talking to the durable store.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StoreError {
    /// storage backend failure: {0}
    Backend(String),
    /// stored value for `{0}` has an unexpected shape
    Corrupt(&'static str),
}

/// Durable string-keyed storage grouped into named collections.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Applies every write in one transaction; a value of `None` removes the
    /// key. Readers see all of the batch or none of it.
    async fn write_batch(
        &self,
        collection: &str,
        writes: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), StoreError>;
}

/// Reference [`KeyValueStore`] backed by process memory.
///
/// Nothing survives a restart, which makes it the store of choice for tests
/// and throwaway tooling.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    collections: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let collections = self.collections.lock().expect("not poisoned");
        Ok(collections
            .get(collection)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn write_batch(
        &self,
        collection: &str,
        writes: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().expect("not poisoned");
        let entries = collections.entry(collection.to_string()).or_default();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn encode_u32(value: u32) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub(crate) fn decode_u32(bytes: &[u8], field: &'static str) -> Result<u32, StoreError> {
    let bytes: [u8; 4] = bytes.try_into().map_err(|_| StoreError::Corrupt(field))?;
    Ok(u32::from_be_bytes(bytes))
}

fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

fn decode_bool(bytes: &[u8], field: &'static str) -> Result<bool, StoreError> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(StoreError::Corrupt(field)),
    }
}

const KEYS_COLLECTION: &str = "KeyBackupService_Keys";

const MASTER_KEY_KEY: &str = "masterKey";
const PIN_TYPE_KEY: &str = "pinType";
const VERIFICATION_STRING_KEY: &str = "encodedVerificationString";
const STORAGE_SERVICE_KEY_KEY: &str = "storageServiceKey";
const BACKUP_REQUEST_FAILED_KEY: &str = "hasBackupKeyRequestFailed";

/// Everything persisted in the keys collection, read in one pass.
#[derive(Debug, Default)]
pub(crate) struct PersistedKeys {
    pub master_key: Option<MasterKey>,
    pub storage_service_key: Option<[u8; 32]>,
    pub pin_type: Option<PinType>,
    pub verification_string: Option<String>,
    pub backup_request_failed: bool,
    pub synced_keys: HashMap<DerivedKey, Vec<u8>>,
}

/// Typed facade over the keys collection.
pub(crate) struct KeyStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn read_all(&self) -> Result<PersistedKeys, StoreError> {
        let master_key = match self.store.get(KEYS_COLLECTION, MASTER_KEY_KEY).await? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(MASTER_KEY_KEY))?;
                Some(MasterKey::from(bytes))
            }
            None => None,
        };
        let storage_service_key = match self
            .store
            .get(KEYS_COLLECTION, STORAGE_SERVICE_KEY_KEY)
            .await?
        {
            Some(bytes) => Some(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(STORAGE_SERVICE_KEY_KEY))?,
            ),
            None => None,
        };
        let pin_type = match self.store.get(KEYS_COLLECTION, PIN_TYPE_KEY).await? {
            Some(bytes) => Some(
                PinType::from_raw(decode_u32(&bytes, PIN_TYPE_KEY)?)
                    .ok_or(StoreError::Corrupt(PIN_TYPE_KEY))?,
            ),
            None => None,
        };
        let verification_string = match self
            .store
            .get(KEYS_COLLECTION, VERIFICATION_STRING_KEY)
            .await?
        {
            Some(bytes) => Some(
                String::from_utf8(bytes)
                    .map_err(|_| StoreError::Corrupt(VERIFICATION_STRING_KEY))?,
            ),
            None => None,
        };
        let backup_request_failed = self.backup_request_failed().await?;

        let mut synced_keys = HashMap::new();
        for key in DerivedKey::SYNCABLE {
            if let Some(data) = self.store.get(KEYS_COLLECTION, &key.label()).await? {
                synced_keys.insert(key.clone(), data);
            }
        }

        Ok(PersistedKeys {
            master_key,
            storage_service_key,
            pin_type,
            verification_string,
            backup_request_failed,
            synced_keys,
        })
    }

    /// Atomic group write of a pin change; also resets the failed-backup
    /// flag, since the caller only gets here after a successful backup.
    pub async fn write_keys(
        &self,
        master_key: &MasterKey,
        pin_type: PinType,
        verification_string: &str,
    ) -> Result<(), StoreError> {
        self.store
            .write_batch(
                KEYS_COLLECTION,
                vec![
                    (
                        MASTER_KEY_KEY.to_string(),
                        Some(master_key.as_bytes().to_vec()),
                    ),
                    (PIN_TYPE_KEY.to_string(), Some(encode_u32(pin_type.raw()))),
                    (
                        VERIFICATION_STRING_KEY.to_string(),
                        Some(verification_string.as_bytes().to_vec()),
                    ),
                    (
                        BACKUP_REQUEST_FAILED_KEY.to_string(),
                        Some(encode_bool(false)),
                    ),
                ],
            )
            .await
    }

    pub async fn write_storage_service_key(&self, key: &[u8; 32]) -> Result<(), StoreError> {
        self.store
            .write_batch(
                KEYS_COLLECTION,
                vec![(STORAGE_SERVICE_KEY_KEY.to_string(), Some(key.to_vec()))],
            )
            .await
    }

    pub async fn write_synced_key(
        &self,
        key: &DerivedKey,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.store
            .write_batch(
                KEYS_COLLECTION,
                vec![(key.label(), Some(data.to_vec()))],
            )
            .await
    }

    pub async fn set_backup_request_failed(&self, failed: bool) -> Result<(), StoreError> {
        self.store
            .write_batch(
                KEYS_COLLECTION,
                vec![(
                    BACKUP_REQUEST_FAILED_KEY.to_string(),
                    Some(encode_bool(failed)),
                )],
            )
            .await
    }

    pub async fn backup_request_failed(&self) -> Result<bool, StoreError> {
        match self
            .store
            .get(KEYS_COLLECTION, BACKUP_REQUEST_FAILED_KEY)
            .await?
        {
            Some(bytes) => decode_bool(&bytes, BACKUP_REQUEST_FAILED_KEY),
            None => Ok(false),
        }
    }

    /// Removes every key except the transitional storage service key, which
    /// outlives the master key it will eventually be derived from.
    pub async fn clear_except_storage_service_key(&self) -> Result<(), StoreError> {
        let mut writes: Vec<(String, Option<Vec<u8>>)> = vec![
            (MASTER_KEY_KEY.to_string(), None),
            (PIN_TYPE_KEY.to_string(), None),
            (VERIFICATION_STRING_KEY.to_string(), None),
            (BACKUP_REQUEST_FAILED_KEY.to_string(), None),
        ];
        writes.extend(DerivedKey::SYNCABLE.iter().map(|key| (key.label(), None)));
        self.store.write_batch(KEYS_COLLECTION, writes).await
    }
}
