//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Wire messages exchanged with the key backup enclave.
//!
//! A serialized [`Request`] is the plaintext of the attested channel; the
//! decrypted channel payload parses as [`Response`]. Exactly one inner
//! request is set per round trip, and the enclave answers with the matching
//! inner response.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub backup: Option<BackupRequest>,
    #[prost(message, optional, tag = "2")]
    pub restore: Option<RestoreRequest>,
    #[prost(message, optional, tag = "3")]
    pub delete: Option<DeleteRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub backup: Option<BackupResponse>,
    #[prost(message, optional, tag = "2")]
    pub restore: Option<RestoreResponse>,
    #[prost(message, optional, tag = "3")]
    pub delete: Option<DeleteResponse>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackupRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub backup_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
    /// Seconds since the Unix epoch; requests older than this are rejected.
    #[prost(uint64, tag = "4")]
    pub valid_from: u64,
    /// The sealed master key envelope.
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
    /// The pin-derived access key guarding the record.
    #[prost(bytes = "vec", tag = "6")]
    pub pin: Vec<u8>,
    /// Guess budget before the enclave destroys the record.
    #[prost(uint32, tag = "7")]
    pub tries: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RestoreRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub backup_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub valid_from: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub pin: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub backup_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub valid_from: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackupResponse {
    #[prost(enumeration = "BackupStatus", tag = "1")]
    pub status_code: i32,
    /// Token for the next request.
    #[prost(bytes = "vec", tag = "2")]
    pub token: Vec<u8>,
}

impl BackupResponse {
    pub fn status(&self) -> BackupStatus {
        BackupStatus::try_from(self.status_code).unwrap_or(BackupStatus::Unknown)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BackupStatus {
    Unknown = 0,
    Ok = 1,
    /// The presented token was already spent.
    AlreadyExists = 2,
    /// The request's validity window is in the future.
    NotYetValid = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RestoreResponse {
    #[prost(enumeration = "RestoreStatus", tag = "1")]
    pub status_code: i32,
    /// Token for the next request. Absent when the record is missing.
    #[prost(bytes = "vec", tag = "2")]
    pub token: Vec<u8>,
    /// The sealed master key envelope. Only set on `Ok`.
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    /// Remaining guesses before the enclave destroys the record.
    #[prost(uint32, tag = "4")]
    pub tries: u32,
}

impl RestoreResponse {
    pub fn status(&self) -> RestoreStatus {
        RestoreStatus::try_from(self.status_code).unwrap_or(RestoreStatus::Unknown)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RestoreStatus {
    Unknown = 0,
    Ok = 1,
    /// The presented token was already spent.
    TokenMismatch = 2,
    /// The request's validity window is in the future.
    NotYetValid = 3,
    /// No record exists for this backup id.
    Missing = 4,
    /// Wrong access key; the guess budget was decremented.
    PinMismatch = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteResponse {}
