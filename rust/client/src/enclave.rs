//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The attested request pipeline.
//!
//! Requests are protobuf-serialized, sealed with AES-256-GCM under the
//! client key agreed during remote attestation, and POSTed through the
//! transport; response bodies carry the ciphertext back as base64 JSON and
//! open under the server key. The pipeline also enforces the token
//! discipline: every request carries the current one-shot token, fetching
//! the bootstrap token when none is stored.

use core::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use prost::Message as _;
use rand::rngs::OsRng;
use rand::RngCore as _;

use crate::error::{Error, Result};
use crate::proto;
use crate::token::{Token, TokenStore};

pub(crate) const GCM_IV_LEN: usize = 12;
pub(crate) const GCM_TAG_LEN: usize = 16;

/// Basic auth credentials for the key backup frontend.
#[derive(Clone)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"redacted")
            .finish()
    }
}

/// Session keys agreed during remote attestation.
#[derive(Clone)]
pub struct AttestationKeys {
    /// Seals request plaintext; known only to this client and the enclave.
    pub client_key: [u8; 32],
    /// Opens response ciphertext.
    pub server_key: [u8; 32],
}

/// An attested session with the enclave, as produced by the handshake.
#[derive(Clone)]
pub struct RemoteAttestation {
    pub request_id: Vec<u8>,
    pub enclave_name: String,
    pub keys: AttestationKeys,
    pub auth: Auth,
    pub cookies: Vec<String>,
}

/// Performs the remote attestation handshake with the enclave.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Attests the key backup enclave, optionally under explicit
    /// credentials (e.g. during registration, before the account exists
    /// locally).
    async fn perform_for_key_backup(
        &self,
        auth: Option<Auth>,
    ) -> std::result::Result<RemoteAttestation, TransportError>;
}

/// An encrypted request ready to POST to the enclave frontend.
pub struct OuterRequest {
    pub request_id: Vec<u8>,
    pub data: Vec<u8>,
    pub iv: [u8; GCM_IV_LEN],
    pub mac: [u8; GCM_TAG_LEN],
    pub enclave_name: String,
    pub auth: Auth,
    pub cookies: Vec<String>,
    /// Stable tag routed on in the request path: `backup`, `restore` or
    /// `delete`.
    pub request_type: &'static str,
}

/// HTTP transport to the key backup frontend.
#[async_trait]
pub trait KbsTransport: Send + Sync {
    /// POSTs the encrypted request, returning the raw response body.
    async fn make_request(
        &self,
        request: OuterRequest,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    /// Fetches the token bootstrap body for a fresh attested session.
    async fn fetch_token(
        &self,
        attestation: &RemoteAttestation,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Failure below the protocol layer.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportError {
    /// service unreachable: {0}
    Unreachable(String),
    /// unexpected HTTP status {0}
    UnexpectedStatus(u16),
    /// attestation handshake failed: {0}
    Attestation(String),
}

/// One of the inner request kinds the enclave understands.
///
/// Each kind knows the tag the frontend routes on, how to place itself into
/// the outer request, and how to pull its typed response back out of the
/// outer response. Statically dispatched; the three implementations are the
/// prost request types themselves.
pub(crate) trait RequestOption: Send {
    type Response;

    const TAG: &'static str;

    fn attach(self, request: &mut proto::Request);
    fn extract(response: proto::Response) -> Option<Self::Response>;
}

impl RequestOption for proto::BackupRequest {
    type Response = proto::BackupResponse;

    const TAG: &'static str = "backup";

    fn attach(self, request: &mut proto::Request) {
        request.backup = Some(self);
    }

    fn extract(response: proto::Response) -> Option<Self::Response> {
        response.backup
    }
}

impl RequestOption for proto::RestoreRequest {
    type Response = proto::RestoreResponse;

    const TAG: &'static str = "restore";

    fn attach(self, request: &mut proto::Request) {
        request.restore = Some(self);
    }

    fn extract(response: proto::Response) -> Option<Self::Response> {
        response.restore
    }
}

impl RequestOption for proto::DeleteRequest {
    type Response = proto::DeleteResponse;

    const TAG: &'static str = "delete";

    fn attach(self, request: &mut proto::Request) {
        request.delete = Some(self);
    }

    fn extract(response: proto::Response) -> Option<Self::Response> {
        response.delete
    }
}

/// Body of an enclave response: everything base64.
#[derive(serde::Deserialize)]
struct OuterResponse {
    data: String,
    iv: String,
    mac: String,
}

/// Encrypted request/response pipeline over attested sessions.
pub(crate) struct EnclaveClient<T, A> {
    transport: T,
    attestation: A,
    tokens: TokenStore,
}

impl<T: KbsTransport, A: AttestationProvider> EnclaveClient<T, A> {
    pub fn new(transport: T, attestation: A, tokens: TokenStore) -> Self {
        Self {
            transport,
            attestation,
            tokens,
        }
    }

    /// The backup id requests are addressed to. Fetches the initial token
    /// when none is stored; otherwise no network traffic.
    pub async fn backup_id(&self, auth: Option<Auth>) -> Result<[u8; 32]> {
        if let Some(token) = self.tokens.current().await? {
            return Ok(*token.backup_id());
        }
        let attestation = self.attestation.perform_for_key_backup(auth).await?;
        let token = self.fetch_token(&attestation).await?;
        Ok(*token.backup_id())
    }

    /// Runs one attested round trip: attest, ensure a token, build the
    /// inner request, seal, POST, open, extract.
    pub async fn request<R: RequestOption>(
        &self,
        auth: Option<Auth>,
        build: impl FnOnce(&Token) -> R + Send,
    ) -> Result<R::Response> {
        let attestation = self.attestation.perform_for_key_backup(auth).await?;
        let token = self.ensure_token(&attestation).await?;

        let mut outer = proto::Request::default();
        build(&token).attach(&mut outer);
        let plaintext = outer.encode_to_vec();

        let mut iv = [0u8; GCM_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut sealed = aes_256_gcm_seal(
            &attestation.keys.client_key,
            &iv,
            &plaintext,
            &attestation.request_id,
        )?;
        let mac_offset = sealed.len() - GCM_TAG_LEN;
        let mac: [u8; GCM_TAG_LEN] = sealed[mac_offset..]
            .try_into()
            .expect("sliced to length");
        sealed.truncate(mac_offset);

        let body = self
            .transport
            .make_request(OuterRequest {
                request_id: attestation.request_id.clone(),
                data: sealed,
                iv,
                mac,
                enclave_name: attestation.enclave_name.clone(),
                auth: attestation.auth.clone(),
                cookies: attestation.cookies.clone(),
                request_type: R::TAG,
            })
            .await?;

        let outer: OuterResponse = serde_json::from_slice(&body)?;
        let data = BASE64_STANDARD
            .decode(&outer.data)
            .map_err(|_| Error::assert("response data is not base64"))?;
        let iv: [u8; GCM_IV_LEN] = decode_fixed("response iv", &outer.iv)?;
        let mac: [u8; GCM_TAG_LEN] = decode_fixed("response mac", &outer.mac)?;

        let mut ciphertext = data;
        ciphertext.extend_from_slice(&mac);
        let plaintext = aes_256_gcm_open(&attestation.keys.server_key, &iv, &ciphertext, &[])?;

        let response = proto::Response::decode(plaintext.as_slice())?;
        R::extract(response)
            .ok_or_else(|| Error::assert(format!("response is missing its {} payload", R::TAG)))
    }

    async fn ensure_token(&self, attestation: &RemoteAttestation) -> Result<Token> {
        if let Some(token) = self.tokens.current().await? {
            return Ok(token);
        }
        self.fetch_token(attestation).await
    }

    async fn fetch_token(&self, attestation: &RemoteAttestation) -> Result<Token> {
        log::info!("no enclave token on hand, fetching the bootstrap token");
        let body = self.transport.fetch_token(attestation).await?;
        self.tokens.update_from_bootstrap(&body).await
    }
}

/// AES-256-GCM seal; returns ciphertext with the 16 byte tag appended.
pub(crate) fn aes_256_gcm_seal(
    key: &[u8],
    iv: &[u8; GCM_IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::assert("AES-256-GCM requires a 32 byte key"))?;
    cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::assert("encryption failed"))
}

/// AES-256-GCM open of tag-suffixed ciphertext produced by
/// [`aes_256_gcm_seal`].
pub(crate) fn aes_256_gcm_open(
    key: &[u8],
    iv: &[u8; GCM_IV_LEN],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::assert("AES-256-GCM requires a 32 byte key"))?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| Error::assert("decryption failed"))
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = BASE64_STANDARD
        .decode(value)
        .map_err(|_| Error::assert(format!("{field} is not base64")))?;
    bytes
        .try_into()
        .map_err(|_| Error::assert(format!("{field} must be {N} bytes")))
}
