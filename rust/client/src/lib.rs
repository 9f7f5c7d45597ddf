//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Client for a PIN-gated key backup service.
//!
//! A user's 32 byte master key is wrapped with a key stretched from their pin
//! and stored in a remote attested enclave. Only a client that knows the pin
//! can unwrap it, and the enclave destroys the record after a bounded number
//! of wrong guesses, so a compromised server learns nothing beyond that
//! rate-limited guess budget.
//!
//! [`KeyBackupService`] is the entry point. It owns the in-memory key cache,
//! drives the backup / restore / delete protocol over an attested channel,
//! and exposes the domain-separated keys derived from the master key.
//! Transport, attestation, durable storage and account state are
//! collaborators behind traits.

mod enclave;
pub mod envelope;
mod error;
mod events;
mod keys;
mod proto;
mod service;
mod store;
mod token;

pub use enclave::{
    AttestationKeys, AttestationProvider, Auth, KbsTransport, OuterRequest, RemoteAttestation,
    TransportError,
};
pub use error::{Error, Result};
pub use events::{EventSubscription, KeyBackupEvents, ObservableEvent};
pub use keys::{derive_named, DerivedKey, MasterKey, MASTER_KEY_LEN};
pub use service::{AccountState, Clock, KeyBackupService, SystemClock, MAXIMUM_KEY_ATTEMPTS};
pub use store::{InMemoryKeyValueStore, KeyValueStore, StoreError};
pub use token::{Token, TokenStore};
