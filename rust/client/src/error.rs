//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use crate::enclave::TransportError;
use crate::store::StoreError;

/// Errors surfaced while backing up, restoring or using keys.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// wrong pin, {tries_remaining} tries remaining
    InvalidPin {
        /// Authoritative remaining-guess count reported by the enclave.
        tries_remaining: u32,
    },
    /// no backup record exists for this user
    BackupMissing,
    /// assertion failed: {0}
    Assertion(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn assert(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Assertion(format!("storage: {e}"))
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Assertion(format!("transport: {e}"))
    }
}

impl From<kbs_pin::Error> for Error {
    fn from(e: kbs_pin::Error) -> Self {
        Self::Assertion(format!("pin hashing: {e}"))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Self::Assertion(format!("malformed enclave payload: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Assertion(format!("malformed response body: {e}"))
    }
}
