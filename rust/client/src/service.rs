//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The key backup service itself.
//!
//! [`KeyBackupService`] owns the process-wide key cache behind a mutex,
//! drives the backup / restore / delete protocol through the attested
//! pipeline, and serves the derived-key tree. Argon2 runs on the blocking
//! pool; the cache lock is only ever held for assignments.
//!
//! Concurrent protocol operations are not serialized here: two callers
//! racing will both spend tokens and the loser observes a token mismatch.
//! Callers gate operations through their own higher-level lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use kbs_pin::{local_pin_hash, normalize_pin, verify_local_pin_hash, PinHash, PinType};
use rand::rngs::OsRng;
use rand::RngCore as _;

use crate::enclave::{
    aes_256_gcm_open, aes_256_gcm_seal, AttestationProvider, Auth, EnclaveClient, KbsTransport,
    GCM_IV_LEN, GCM_TAG_LEN,
};
use crate::envelope;
use crate::error::{Error, Result};
use crate::events::KeyBackupEvents;
use crate::keys::{derive_named, DerivedKey, MasterKey};
use crate::proto;
use crate::store::{KeyStore, KeyValueStore};
use crate::token::TokenStore;

/// PIN attempts the enclave allows before it destroys the record.
pub const MAXIMUM_KEY_ATTEMPTS: u32 = 10;

/// How far in the past a request's validity window opens.
const REQUEST_VALIDITY_WINDOW_SECS: u64 = 86_400;

/// Device-level account state the service consults.
pub trait AccountState: Send + Sync {
    fn is_primary_device(&self) -> bool;
    fn is_registered_primary_device(&self) -> bool;
    fn is_registered_and_ready(&self) -> bool;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// In-memory view of the persisted keys. Guarded by the service's mutex;
/// holders only ever read or assign, never block.
#[derive(Default)]
struct Cache {
    master_key: Option<MasterKey>,
    storage_service_key: Option<[u8; 32]>,
    pin_type: Option<PinType>,
    verification_string: Option<String>,
    synced_keys: HashMap<DerivedKey, Vec<u8>>,
}

/// Client for the PIN-gated key backup enclave.
pub struct KeyBackupService<T, A> {
    cache: Mutex<Cache>,
    keys: KeyStore,
    tokens: TokenStore,
    enclave: EnclaveClient<T, A>,
    account: Arc<dyn AccountState>,
    clock: Arc<dyn Clock>,
    events: Arc<KeyBackupEvents>,
    service_id: Vec<u8>,
    test_mode: bool,
}

impl<T: KbsTransport, A: AttestationProvider> KeyBackupService<T, A> {
    pub fn new(
        transport: T,
        attestation: A,
        store: Arc<dyn KeyValueStore>,
        account: Arc<dyn AccountState>,
        clock: Arc<dyn Clock>,
        events: Arc<KeyBackupEvents>,
        service_id_hex: &str,
    ) -> Result<Self> {
        let service_id =
            hex::decode(service_id_hex).map_err(|_| Error::assert("service id must be hex"))?;
        if service_id.is_empty() {
            return Err(Error::assert("service id must not be empty"));
        }
        let tokens = TokenStore::new(store.clone());
        let enclave = EnclaveClient::new(transport, attestation, tokens.clone());
        Ok(Self {
            cache: Mutex::new(Cache::default()),
            keys: KeyStore::new(store),
            tokens,
            enclave,
            account,
            clock,
            events,
            service_id,
            test_mode: false,
        })
    }

    /// Lets a primary device accept synced keys, which only makes sense in
    /// tests.
    pub fn accept_synced_keys_for_testing(&mut self) {
        self.test_mode = true;
    }

    /// Loads the persisted keys into the cache. Call once at startup.
    ///
    /// A primary device with no storage service key on disk mints one here;
    /// the key currently lives independently of the master key so it must
    /// exist before the first manifest is built.
    pub async fn warm_caches(&self) -> Result<()> {
        let mut persisted = self.keys.read_all().await?;

        if self.account.is_primary_device() && persisted.storage_service_key.is_none() {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            self.keys.write_storage_service_key(&key).await?;
            persisted.storage_service_key = Some(key);
            log::info!("minted a storage service key");
        }

        let mut cache = self.cache.lock().expect("not poisoned");
        cache.master_key = persisted.master_key;
        cache.storage_service_key = persisted.storage_service_key;
        cache.pin_type = persisted.pin_type;
        cache.verification_string = persisted.verification_string;
        cache.synced_keys = persisted.synced_keys;
        Ok(())
    }

    pub fn has_master_key(&self) -> bool {
        self.cache.lock().expect("not poisoned").master_key.is_some()
    }

    pub fn current_pin_type(&self) -> Option<PinType> {
        self.cache.lock().expect("not poisoned").pin_type
    }

    /// Whether the last backup attempt failed and should be retried.
    pub async fn has_backup_key_request_failed(&self) -> Result<bool> {
        Ok(self.keys.backup_request_failed().await?)
    }

    /// Checks `pin` against the locally stored verification string.
    ///
    /// Resolves `false` on every failure path; never errors.
    pub async fn verify_pin(&self, pin: &str) -> bool {
        let encoded = self
            .cache
            .lock()
            .expect("not poisoned")
            .verification_string
            .clone();
        let Some(encoded) = encoded else {
            log::warn!("tried to verify a pin with no verification string on hand");
            return false;
        };
        let pin = pin.to_string();
        tokio::task::spawn_blocking(move || {
            let normalized = normalize_pin(&pin);
            verify_local_pin_hash(&encoded, normalized.as_bytes()).unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }

    /// Wraps the master key under `pin` and stores it with the enclave,
    /// minting a fresh master key if none is cached.
    pub async fn generate_and_backup(&self, pin: &str) -> Result<()> {
        let backup_id = self.enclave.backup_id(None).await?;
        let master_key = self
            .cache
            .lock()
            .expect("not poisoned")
            .master_key
            .clone()
            .unwrap_or_else(|| MasterKey::generate(&mut OsRng));

        let hashed = derive_access_keys(pin, backup_id).await?;
        let sealed = envelope::seal(master_key.as_bytes(), &hashed.encryption_key);

        let response = match self.backup_request(None, &hashed.access_key, &sealed).await {
            Ok(response) => response,
            Err(error) => {
                // Recorded so higher layers can schedule a retry.
                if let Err(store_error) = self.keys.set_backup_request_failed(true).await {
                    log::error!("could not record the failed backup request: {store_error}");
                }
                return Err(error);
            }
        };

        self.tokens.update_next(&response.token, None, None).await?;
        self.handle_backup_status(response.status())?;

        self.store_pin_change(pin, master_key).await
    }

    /// Recovers the master key from the enclave with the user's pin.
    ///
    /// A successful restore immediately backs the envelope up again: the
    /// server decrements the guess budget on every restore attempt and only
    /// a fresh backup resets it to [`MAXIMUM_KEY_ATTEMPTS`].
    pub async fn restore_keys(&self, pin: &str, auth: Option<Auth>) -> Result<()> {
        let backup_id = self.enclave.backup_id(auth.clone()).await?;
        let hashed = derive_access_keys(pin, backup_id).await?;

        let response = self.restore_request(auth.clone(), &hashed.access_key).await?;
        let status = response.status();
        if status != proto::RestoreStatus::Missing {
            self.tokens
                .update_next(&response.token, None, Some(response.tries))
                .await?;
        }
        match status {
            proto::RestoreStatus::Ok => {}
            proto::RestoreStatus::TokenMismatch => {
                return Err(Error::assert("restore request presented a spent token"));
            }
            proto::RestoreStatus::PinMismatch => {
                return Err(Error::InvalidPin {
                    tries_remaining: response.tries,
                });
            }
            proto::RestoreStatus::Missing => return Err(Error::BackupMissing),
            proto::RestoreStatus::NotYetValid => {
                return Err(Error::assert("restore request predates its validity window"));
            }
            proto::RestoreStatus::Unknown => {
                return Err(Error::assert("restore response has no status"));
            }
        }

        let master_key = MasterKey::from(envelope::open(&response.data, &hashed.encryption_key)?);

        let backup_response = self
            .backup_request(auth, &hashed.access_key, &response.data)
            .await?;
        self.tokens
            .update_next(&backup_response.token, None, None)
            .await?;
        self.handle_backup_status(backup_response.status())?;

        self.store_pin_change(pin, master_key).await
    }

    /// Deletes the backup record from the enclave, then clears all local
    /// keys and the token whether or not the enclave request went through.
    pub async fn delete_keys(&self) -> Result<()> {
        let deleted = self.delete_request(None).await;
        if let Err(error) = &deleted {
            log::warn!("enclave delete failed, clearing local keys anyway: {error}");
        }
        self.clear_keys().await?;
        self.tokens.clear_next().await?;
        deleted.map(drop)
    }

    /// Removes every cached and persisted key except the transitional
    /// storage service key.
    pub async fn clear_keys(&self) -> Result<()> {
        self.keys.clear_except_storage_service_key().await?;
        let mut cache = self.cache.lock().expect("not poisoned");
        let storage_service_key = cache.storage_service_key;
        *cache = Cache::default();
        cache.storage_service_key = storage_service_key;
        Ok(())
    }

    /// Records a derived key received from the primary device over the sync
    /// channel. Only the keys in [`DerivedKey::SYNCABLE`] are accepted, and
    /// only on linked devices.
    pub async fn store_synced_key(&self, key: DerivedKey, data: Vec<u8>) -> Result<()> {
        if self.account.is_primary_device() && !self.test_mode {
            return Err(Error::assert(
                "primary devices derive keys, they do not sync them",
            ));
        }
        if !key.is_syncable() {
            return Err(Error::assert(format!("refusing to sync {key:?}")));
        }

        let changed = {
            let cache = self.cache.lock().expect("not poisoned");
            cache.synced_keys.get(&key) != Some(&data)
        };
        if !changed {
            return Ok(());
        }

        self.keys.write_synced_key(&key, &data).await?;
        self.cache
            .lock()
            .expect("not poisoned")
            .synced_keys
            .insert(key.clone(), data);

        if key == DerivedKey::StorageService {
            // The local manifest no longer decrypts under the new key.
            self.events.manifest_needs_rebuild.fire();
        }
        Ok(())
    }

    /// Key material for `key`, when its derivation chain is available.
    pub fn data_for(&self, key: &DerivedKey) -> Option<Vec<u8>> {
        let cache = self.cache.lock().expect("not poisoned");
        self.data_for_locked(key, &cache)
    }

    fn data_for_locked(&self, key: &DerivedKey, cache: &Cache) -> Option<Vec<u8>> {
        if !self.account.is_primary_device() || self.test_mode {
            if let Some(data) = cache.synced_keys.get(key) {
                return Some(data.clone());
            }
        }
        if *key == DerivedKey::StorageService {
            // Transitional: primary devices hold an independent storage
            // service key instead of deriving one from the master key.
            // Moving to derivation means removing this branch, nothing else.
            if let Some(independent) = cache.storage_service_key {
                return Some(independent.to_vec());
            }
        }
        let parent = match key.parent() {
            Some(parent) => self.data_for_locked(&parent, cache)?,
            None => cache.master_key.as_ref()?.as_bytes().to_vec(),
        };
        Some(derive_named(&parent, &key.label()).to_vec())
    }

    /// Encrypts `plaintext` under `key`. Output layout: `iv ∥ ciphertext ∥
    /// tag`, fresh random IV per call.
    pub fn encrypt(&self, key: &DerivedKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key_data = self
            .data_for(key)
            .ok_or_else(|| Error::assert(format!("no key material available for {key:?}")))?;
        let mut iv = [0u8; GCM_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let sealed = aes_256_gcm_seal(&key_data, &iv, plaintext, &[])?;
        let mut out = Vec::with_capacity(GCM_IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypts data produced by [`Self::encrypt`].
    pub fn decrypt(&self, key: &DerivedKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key_data = self
            .data_for(key)
            .ok_or_else(|| Error::assert(format!("no key material available for {key:?}")))?;
        if ciphertext.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(Error::assert("ciphertext too short"));
        }
        let (iv, body) = ciphertext.split_at(GCM_IV_LEN);
        let iv: [u8; GCM_IV_LEN] = iv.try_into().expect("split to length");
        aes_256_gcm_open(&key_data, &iv, body, &[])
    }

    /// Uppercase hex token proving registration lock ownership, when the
    /// master key is available.
    pub fn registration_lock_token(&self) -> Option<String> {
        self.data_for(&DerivedKey::RegistrationLock)
            .map(|data| hex::encode_upper(data))
    }

    async fn backup_request(
        &self,
        auth: Option<Auth>,
        access_key: &[u8; 32],
        sealed: &[u8],
    ) -> Result<proto::BackupResponse> {
        let service_id = self.service_id.clone();
        let valid_from = self.valid_from();
        let pin = access_key.to_vec();
        let data = sealed.to_vec();
        self.enclave
            .request(auth, move |token| proto::BackupRequest {
                service_id,
                backup_id: token.backup_id().to_vec(),
                token: token.data().to_vec(),
                valid_from,
                data,
                pin,
                tries: MAXIMUM_KEY_ATTEMPTS,
            })
            .await
    }

    async fn restore_request(
        &self,
        auth: Option<Auth>,
        access_key: &[u8; 32],
    ) -> Result<proto::RestoreResponse> {
        let service_id = self.service_id.clone();
        let valid_from = self.valid_from();
        let pin = access_key.to_vec();
        self.enclave
            .request(auth, move |token| proto::RestoreRequest {
                service_id,
                backup_id: token.backup_id().to_vec(),
                token: token.data().to_vec(),
                valid_from,
                pin,
            })
            .await
    }

    async fn delete_request(&self, auth: Option<Auth>) -> Result<proto::DeleteResponse> {
        let service_id = self.service_id.clone();
        let valid_from = self.valid_from();
        self.enclave
            .request(auth, move |token| proto::DeleteRequest {
                service_id,
                backup_id: token.backup_id().to_vec(),
                token: token.data().to_vec(),
                valid_from,
            })
            .await
    }

    fn handle_backup_status(&self, status: proto::BackupStatus) -> Result<()> {
        match status {
            proto::BackupStatus::Ok => Ok(()),
            proto::BackupStatus::AlreadyExists => {
                // The token we presented was already spent; the response
                // still carried the next one, which is stored by now.
                log::warn!("backup request presented a spent token");
                Ok(())
            }
            proto::BackupStatus::NotYetValid => {
                Err(Error::assert("backup request predates its validity window"))
            }
            proto::BackupStatus::Unknown => Err(Error::assert("backup response has no status")),
        }
    }

    /// Derives the verification string off-thread, then commits the pin
    /// change: one atomic store, events after it completes.
    async fn store_pin_change(&self, pin: &str, master_key: MasterKey) -> Result<()> {
        let pin = pin.to_string();
        let (pin_type, verification_string) = tokio::task::spawn_blocking(move || {
            let normalized = normalize_pin(&pin);
            let encoded = local_pin_hash(normalized.as_bytes())?;
            Ok::<_, kbs_pin::Error>((PinType::for_pin(&normalized), encoded))
        })
        .await
        .map_err(|_| Error::assert("pin hashing task aborted"))??;

        let (changed, master_key_changed) = {
            let cache = self.cache.lock().expect("not poisoned");
            let master_key_changed = cache.master_key.as_ref() != Some(&master_key);
            let changed = master_key_changed
                || cache.pin_type != Some(pin_type)
                || cache.verification_string.as_deref() != Some(verification_string.as_str());
            (changed, master_key_changed)
        };
        if !changed {
            return Ok(());
        }

        self.keys
            .write_keys(&master_key, pin_type, &verification_string)
            .await?;

        {
            let mut cache = self.cache.lock().expect("not poisoned");
            cache.master_key = Some(master_key);
            cache.pin_type = Some(pin_type);
            cache.verification_string = Some(verification_string);
        }

        if master_key_changed && self.account.is_registered_and_ready() {
            self.events.manifest_needs_rebuild.fire();
            self.events.send_keys_sync_message.fire();
        }
        Ok(())
    }

    fn valid_from(&self) -> u64 {
        let now = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        now.saturating_sub(REQUEST_VALIDITY_WINDOW_SECS)
    }
}

/// Argon2 key stretching on the blocking pool.
async fn derive_access_keys(pin: &str, backup_id: [u8; 32]) -> Result<PinHash> {
    let pin = pin.to_string();
    tokio::task::spawn_blocking(move || {
        let normalized = normalize_pin(&pin);
        PinHash::create(normalized.as_bytes(), &backup_id)
    })
    .await
    .map_err(|_| Error::assert("pin hashing task aborted"))?
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use prost::Message as _;

    use super::*;
    use crate::enclave::{AttestationKeys, OuterRequest, RemoteAttestation, TransportError};
    use crate::events::EventSubscription;
    use crate::store::InMemoryKeyValueStore;

    const CLIENT_KEY: [u8; 32] = [0x11; 32];
    const SERVER_KEY: [u8; 32] = [0x22; 32];
    const REQUEST_ID: &[u8] = b"attested-request-id";
    const BACKUP_ID: [u8; 32] = [0xBA; 32];

    struct EnclaveRecord {
        pin: Vec<u8>,
        data: Vec<u8>,
        tries: u32,
    }

    struct EnclaveState {
        current_token: [u8; 32],
        issued_tokens: u64,
        record: Option<EnclaveRecord>,
        fail_requests: bool,
    }

    impl EnclaveState {
        fn next_token(&mut self) -> [u8; 32] {
            self.issued_tokens += 1;
            let mut token = [0u8; 32];
            token[..8].copy_from_slice(&self.issued_tokens.to_be_bytes());
            self.current_token = token;
            token
        }
    }

    /// A stand-in enclave that really enforces the token and tries
    /// arithmetic, so the tests below exercise the protocol end to end.
    #[derive(Clone)]
    struct FakeEnclave {
        state: Arc<Mutex<EnclaveState>>,
    }

    impl FakeEnclave {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(EnclaveState {
                    current_token: [0u8; 32],
                    issued_tokens: 0,
                    record: None,
                    fail_requests: false,
                })),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.state.lock().unwrap().fail_requests = failing;
        }

        fn current_token(&self) -> [u8; 32] {
            self.state.lock().unwrap().current_token
        }

        fn record_tries(&self) -> Option<u32> {
            self.state.lock().unwrap().record.as_ref().map(|r| r.tries)
        }

        fn handle(&self, request: proto::Request) -> proto::Response {
            let mut state = self.state.lock().unwrap();
            let mut response = proto::Response::default();

            if let Some(backup) = request.backup {
                let status = if backup.token != state.current_token {
                    proto::BackupStatus::AlreadyExists
                } else {
                    state.record = Some(EnclaveRecord {
                        pin: backup.pin,
                        data: backup.data,
                        tries: backup.tries,
                    });
                    proto::BackupStatus::Ok
                };
                response.backup = Some(proto::BackupResponse {
                    status_code: status as i32,
                    token: state.next_token().to_vec(),
                });
            } else if let Some(restore) = request.restore {
                let inner = if restore.token != state.current_token {
                    let tries = state.record.as_ref().map_or(0, |r| r.tries);
                    let token = state.next_token().to_vec();
                    proto::RestoreResponse {
                        status_code: proto::RestoreStatus::TokenMismatch as i32,
                        token,
                        data: vec![],
                        tries,
                    }
                } else if state.record.is_none() {
                    proto::RestoreResponse {
                        status_code: proto::RestoreStatus::Missing as i32,
                        ..Default::default()
                    }
                } else {
                    // Every attempt spends a try; only a fresh backup
                    // resets the budget.
                    state.record.as_mut().unwrap().tries -= 1;
                    let (pin_matches, data, tries) = {
                        let record = state.record.as_ref().unwrap();
                        (record.pin == restore.pin, record.data.clone(), record.tries)
                    };
                    let token = state.next_token().to_vec();
                    if pin_matches {
                        proto::RestoreResponse {
                            status_code: proto::RestoreStatus::Ok as i32,
                            token,
                            data,
                            tries,
                        }
                    } else {
                        if tries == 0 {
                            state.record = None;
                        }
                        proto::RestoreResponse {
                            status_code: proto::RestoreStatus::PinMismatch as i32,
                            token,
                            data: vec![],
                            tries,
                        }
                    }
                };
                response.restore = Some(inner);
            } else if request.delete.is_some() {
                state.record = None;
                response.delete = Some(proto::DeleteResponse {});
            }

            response
        }
    }

    #[async_trait::async_trait]
    impl KbsTransport for FakeEnclave {
        async fn make_request(
            &self,
            request: OuterRequest,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            if self.state.lock().unwrap().fail_requests {
                return Err(TransportError::Unreachable("test outage".to_string()));
            }
            assert_eq!(request.request_id, REQUEST_ID);
            assert!(["backup", "restore", "delete"].contains(&request.request_type));

            let mut ciphertext = request.data;
            ciphertext.extend_from_slice(&request.mac);
            let plaintext =
                aes_256_gcm_open(&CLIENT_KEY, &request.iv, &ciphertext, &request.request_id)
                    .expect("sealed under the client key");
            let decoded = proto::Request::decode(plaintext.as_slice()).expect("valid request");

            let response = self.handle(decoded);

            let iv = [7u8; GCM_IV_LEN];
            let mut sealed = aes_256_gcm_seal(&SERVER_KEY, &iv, &response.encode_to_vec(), &[])
                .expect("seals");
            let mac = sealed.split_off(sealed.len() - GCM_TAG_LEN);
            let body = serde_json::json!({
                "data": BASE64_STANDARD.encode(&sealed),
                "iv": BASE64_STANDARD.encode(iv),
                "mac": BASE64_STANDARD.encode(mac),
            });
            Ok(body.to_string().into_bytes())
        }

        async fn fetch_token(
            &self,
            _attestation: &RemoteAttestation,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            let mut state = self.state.lock().unwrap();
            let token = state.next_token();
            let body = serde_json::json!({
                "backupId": BASE64_STANDARD.encode(BACKUP_ID),
                "token": BASE64_STANDARD.encode(token),
                "tries": MAXIMUM_KEY_ATTEMPTS,
            });
            Ok(body.to_string().into_bytes())
        }
    }

    #[async_trait::async_trait]
    impl AttestationProvider for FakeEnclave {
        async fn perform_for_key_backup(
            &self,
            auth: Option<Auth>,
        ) -> std::result::Result<RemoteAttestation, TransportError> {
            Ok(RemoteAttestation {
                request_id: REQUEST_ID.to_vec(),
                enclave_name: "test-enclave".to_string(),
                keys: AttestationKeys {
                    client_key: CLIENT_KEY,
                    server_key: SERVER_KEY,
                },
                auth: auth.unwrap_or(Auth {
                    username: "attested-user".to_string(),
                    password: "attested-password".to_string(),
                }),
                cookies: vec![],
            })
        }
    }

    struct TestAccount {
        primary: bool,
        registered: bool,
    }

    impl AccountState for TestAccount {
        fn is_primary_device(&self) -> bool {
            self.primary
        }

        fn is_registered_primary_device(&self) -> bool {
            self.primary && self.registered
        }

        fn is_registered_and_ready(&self) -> bool {
            self.registered
        }
    }

    struct TestClient {
        service: KeyBackupService<FakeEnclave, FakeEnclave>,
        manifest_rebuilds: Arc<AtomicU32>,
        keys_syncs: Arc<AtomicU32>,
        _subscriptions: Vec<EventSubscription>,
    }

    fn client(enclave: &FakeEnclave, primary: bool, store: Arc<dyn KeyValueStore>) -> TestClient {
        let events = Arc::new(KeyBackupEvents::default());
        let manifest_rebuilds = Arc::new(AtomicU32::new(0));
        let keys_syncs = Arc::new(AtomicU32::new(0));
        let subscriptions = vec![
            events.manifest_needs_rebuild.subscribe({
                let count = manifest_rebuilds.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
            events.send_keys_sync_message.subscribe({
                let count = keys_syncs.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        ];
        let service = KeyBackupService::new(
            enclave.clone(),
            enclave.clone(),
            store,
            Arc::new(TestAccount {
                primary,
                registered: true,
            }),
            Arc::new(SystemClock),
            events,
            "00abcdef",
        )
        .expect("valid configuration");
        TestClient {
            service,
            manifest_rebuilds,
            keys_syncs,
            _subscriptions: subscriptions,
        }
    }

    fn primary_client(enclave: &FakeEnclave) -> TestClient {
        client(enclave, true, Arc::new(InMemoryKeyValueStore::new()))
    }

    fn linked_client(enclave: &FakeEnclave) -> TestClient {
        client(enclave, false, Arc::new(InMemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn generate_and_backup_stores_keys_and_token() {
        let enclave = FakeEnclave::new();
        let first = primary_client(&enclave);
        first.service.warm_caches().await.unwrap();

        first.service.generate_and_backup("1234").await.unwrap();

        assert!(first.service.has_master_key());
        assert_eq!(first.service.current_pin_type(), Some(PinType::Numeric));
        assert!(first.service.verify_pin("1234").await);
        assert!(!first.service.verify_pin("0000").await);

        let token = first
            .service
            .tokens
            .current()
            .await
            .unwrap()
            .expect("token stored");
        assert_eq!(token.backup_id(), &BACKUP_ID);
        assert_eq!(token.tries(), MAXIMUM_KEY_ATTEMPTS);
        assert_eq!(token.data(), &enclave.current_token());

        assert_eq!(enclave.record_tries(), Some(MAXIMUM_KEY_ATTEMPTS));
        assert_eq!(first.manifest_rebuilds.load(Ordering::SeqCst), 1);
        assert_eq!(first.keys_syncs.load(Ordering::SeqCst), 1);
        assert!(!first.service.has_backup_key_request_failed().await.unwrap());
    }

    #[tokio::test]
    async fn restore_recovers_the_original_master_key() {
        let enclave = FakeEnclave::new();
        let first = primary_client(&enclave);
        first.service.warm_caches().await.unwrap();
        first.service.generate_and_backup("1234").await.unwrap();
        let original = first.service.data_for(&DerivedKey::RegistrationLock);

        let second = primary_client(&enclave);
        second.service.warm_caches().await.unwrap();
        second.service.restore_keys("1234", None).await.unwrap();

        assert!(second.service.has_master_key());
        assert_eq!(second.service.data_for(&DerivedKey::RegistrationLock), original);
        assert!(second.service.verify_pin("1234").await);

        // The budget the enclave holds was reset by the follow-up backup;
        // the persisted count is the one reported at restore time.
        assert_eq!(enclave.record_tries(), Some(MAXIMUM_KEY_ATTEMPTS));
        let token = second.service.tokens.current().await.unwrap().unwrap();
        assert_eq!(token.tries(), MAXIMUM_KEY_ATTEMPTS - 1);
        assert_eq!(token.data(), &enclave.current_token());

        assert_eq!(second.manifest_rebuilds.load(Ordering::SeqCst), 1);
        assert_eq!(second.keys_syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_pin_reports_remaining_tries() {
        let enclave = FakeEnclave::new();
        let first = primary_client(&enclave);
        first.service.warm_caches().await.unwrap();
        first.service.generate_and_backup("1234").await.unwrap();

        let second = primary_client(&enclave);
        second.service.warm_caches().await.unwrap();
        let result = second.service.restore_keys("0000", None).await;
        assert_matches!(
            result,
            Err(Error::InvalidPin {
                tries_remaining
            }) if tries_remaining == MAXIMUM_KEY_ATTEMPTS - 1
        );

        // The response token was recorded; the cache stayed untouched.
        let token = second.service.tokens.current().await.unwrap().unwrap();
        assert_eq!(token.data(), &enclave.current_token());
        assert!(!second.service.has_master_key());
        assert_eq!(second.service.current_pin_type(), None);
        assert_eq!(second.manifest_rebuilds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_backup_leaves_the_token_alone() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();

        let result = only.service.restore_keys("1234", None).await;
        assert_matches!(result, Err(Error::BackupMissing));

        // Only the bootstrap fetch issued a token; the missing response
        // carried none and the store kept what it had.
        let token = only.service.tokens.current().await.unwrap().unwrap();
        assert_eq!(token.data(), &enclave.current_token());
        assert_eq!(enclave.state.lock().unwrap().issued_tokens, 1);
        assert!(!only.service.has_master_key());
    }

    #[tokio::test]
    async fn delete_clears_local_state_but_keeps_the_storage_service_key() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();
        only.service.generate_and_backup("1234").await.unwrap();
        let storage_key = only.service.data_for(&DerivedKey::StorageService);
        assert!(storage_key.is_some());

        only.service.delete_keys().await.unwrap();

        assert!(!only.service.has_master_key());
        assert_eq!(only.service.current_pin_type(), None);
        assert_eq!(only.service.tokens.current().await.unwrap(), None);
        assert_eq!(only.service.data_for(&DerivedKey::RegistrationLock), None);
        assert_eq!(only.service.registration_lock_token(), None);
        assert_eq!(only.service.data_for(&DerivedKey::StorageService), storage_key);
        assert!(enclave.record_tries().is_none());
        assert!(!only.service.verify_pin("1234").await);
    }

    #[tokio::test]
    async fn failed_backup_sets_the_retry_flag() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();

        enclave.set_failing(true);
        let result = only.service.generate_and_backup("1234").await;
        assert_matches!(result, Err(Error::Assertion(_)));
        assert!(only.service.has_backup_key_request_failed().await.unwrap());
        assert!(!only.service.has_master_key());

        // A later successful backup clears the flag as part of the store.
        enclave.set_failing(false);
        only.service.generate_and_backup("1234").await.unwrap();
        assert!(!only.service.has_backup_key_request_failed().await.unwrap());
    }

    #[tokio::test]
    async fn every_round_trip_records_a_fresh_token() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();

        only.service.generate_and_backup("1234").await.unwrap();
        let first = only.service.tokens.current().await.unwrap().unwrap();

        only.service.generate_and_backup("432112").await.unwrap();
        let second = only.service.tokens.current().await.unwrap().unwrap();

        assert_ne!(first.data(), second.data());
    }

    #[tokio::test]
    async fn caches_survive_a_restart() {
        let enclave = FakeEnclave::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());

        let before = client(&enclave, true, store.clone());
        before.service.warm_caches().await.unwrap();
        before.service.generate_and_backup("1234").await.unwrap();
        let registration_lock = before.service.registration_lock_token();

        let after = client(&enclave, true, store);
        assert!(!after.service.has_master_key());
        after.service.warm_caches().await.unwrap();
        assert!(after.service.has_master_key());
        assert_eq!(after.service.current_pin_type(), Some(PinType::Numeric));
        assert_eq!(after.service.registration_lock_token(), registration_lock);
        assert!(after.service.verify_pin("1234").await);
    }

    #[tokio::test]
    async fn linked_devices_store_synced_keys() {
        let enclave = FakeEnclave::new();
        let linked = linked_client(&enclave);
        linked.service.warm_caches().await.unwrap();

        linked
            .service
            .store_synced_key(DerivedKey::StorageService, vec![9u8; 32])
            .await
            .unwrap();
        assert_eq!(linked.manifest_rebuilds.load(Ordering::SeqCst), 1);

        assert_eq!(
            linked.service.data_for(&DerivedKey::StorageService),
            Some(vec![9u8; 32])
        );
        assert_eq!(
            linked.service.data_for(&DerivedKey::StorageServiceManifest(4)),
            Some(derive_named(&[9u8; 32], "Manifest_4").to_vec())
        );
        // No master key ever reaches a linked device.
        assert_eq!(linked.service.data_for(&DerivedKey::RegistrationLock), None);
        assert_eq!(linked.service.registration_lock_token(), None);

        // Storing the same bytes again is a no-op.
        linked
            .service
            .store_synced_key(DerivedKey::StorageService, vec![9u8; 32])
            .await
            .unwrap();
        assert_eq!(linked.manifest_rebuilds.load(Ordering::SeqCst), 1);

        assert_matches!(
            linked
                .service
                .store_synced_key(DerivedKey::RegistrationLock, vec![1u8; 32])
                .await,
            Err(Error::Assertion(_))
        );
    }

    #[tokio::test]
    async fn primary_devices_reject_synced_keys() {
        let enclave = FakeEnclave::new();
        let primary = primary_client(&enclave);
        primary.service.warm_caches().await.unwrap();
        let minted = primary.service.data_for(&DerivedKey::StorageService);

        assert_matches!(
            primary
                .service
                .store_synced_key(DerivedKey::StorageService, vec![9u8; 32])
                .await,
            Err(Error::Assertion(_))
        );
        // Nothing was written and the minted key still wins.
        assert_eq!(primary.service.data_for(&DerivedKey::StorageService), minted);
        assert_eq!(primary.manifest_rebuilds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registration_lock_token_is_uppercase_hex_of_the_derived_key() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();
        only.service.generate_and_backup("1234").await.unwrap();

        let token = only.service.registration_lock_token().expect("available");
        let derived = only
            .service
            .data_for(&DerivedKey::RegistrationLock)
            .expect("available");
        assert_eq!(token, hex::encode_upper(derived));
        assert_eq!(token.len(), 64);
        assert!(!token.chars().any(|c| c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn derived_key_encryption_round_trips() {
        let enclave = FakeEnclave::new();
        let only = primary_client(&enclave);
        only.service.warm_caches().await.unwrap();
        only.service.generate_and_backup("1234").await.unwrap();

        let record = DerivedKey::StorageServiceRecord(b"contact-17".to_vec());
        let ciphertext = only.service.encrypt(&record, b"attack at dawn").unwrap();
        assert_eq!(
            only.service.decrypt(&record, &ciphertext).unwrap(),
            b"attack at dawn"
        );

        // Fresh IV on every call.
        let again = only.service.encrypt(&record, b"attack at dawn").unwrap();
        assert_ne!(ciphertext, again);

        assert_matches!(
            only.service
                .decrypt(&DerivedKey::StorageServiceManifest(1), &ciphertext),
            Err(Error::Assertion(_))
        );
        assert_matches!(
            only.service.decrypt(&record, &ciphertext[..10]),
            Err(Error::Assertion(_))
        );

        let unavailable = linked_client(&enclave);
        assert_matches!(
            unavailable.service.encrypt(&record, b"nope"),
            Err(Error::Assertion(_))
        );
    }

    #[tokio::test]
    async fn test_mode_lets_a_primary_accept_synced_keys() {
        let enclave = FakeEnclave::new();
        let mut primary = primary_client(&enclave);
        primary.service.accept_synced_keys_for_testing();
        primary.service.warm_caches().await.unwrap();

        primary
            .service
            .store_synced_key(DerivedKey::StorageService, vec![9u8; 32])
            .await
            .unwrap();
        assert_eq!(
            primary.service.data_for(&DerivedKey::StorageService),
            Some(vec![9u8; 32])
        );
    }
}
