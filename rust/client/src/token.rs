//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The enclave's anti-replay token.
//!
//! Every request spends the current token and the response carries the next
//! one; a token is never presented twice. The tries count rides along as the
//! authoritative remaining-guess budget reported by the server.

use std::sync::Arc;

use base64::prelude::{Engine as _, BASE64_STANDARD};

use crate::error::{Error, Result};
use crate::store::{decode_u32, encode_u32, KeyValueStore, StoreError};

const TOKEN_COLLECTION: &str = "KeyBackupService_Token";

const BACKUP_ID_KEY: &str = "backupId";
const DATA_KEY: &str = "data";
const TRIES_KEY: &str = "tries";

/// Single-use cookie the enclave issues for the next request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Token {
    backup_id: [u8; 32],
    data: [u8; 32],
    tries: u32,
}

impl Token {
    pub fn new(backup_id: &[u8], data: &[u8], tries: u32) -> Result<Self> {
        let backup_id = backup_id
            .try_into()
            .map_err(|_| Error::assert("token backup id must be 32 bytes"))?;
        let data = data
            .try_into()
            .map_err(|_| Error::assert("token data must be 32 bytes"))?;
        Ok(Self {
            backup_id,
            data,
            tries,
        })
    }

    pub fn backup_id(&self) -> &[u8; 32] {
        &self.backup_id
    }

    pub fn data(&self) -> &[u8; 32] {
        &self.data
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }
}

/// Body of the enclave's token bootstrap endpoint.
#[derive(serde::Deserialize)]
struct BootstrapBody {
    #[serde(rename = "backupId")]
    backup_id: String,
    token: String,
    tries: u32,
}

/// Persistence for the one-shot token.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The persisted token, or `None` when any field is missing or does not
    /// parse. Callers fetch a fresh token from the enclave in that case.
    pub async fn current(&self) -> Result<Option<Token>> {
        let backup_id = self.store.get(TOKEN_COLLECTION, BACKUP_ID_KEY).await?;
        let data = self.store.get(TOKEN_COLLECTION, DATA_KEY).await?;
        let tries = self.store.get(TOKEN_COLLECTION, TRIES_KEY).await?;

        let (Some(backup_id), Some(data), Some(tries)) = (backup_id, data, tries) else {
            return Ok(None);
        };
        let Ok(tries) = decode_u32(&tries, TRIES_KEY) else {
            log::warn!("persisted token tries are corrupt, refetching");
            return Ok(None);
        };
        match Token::new(&backup_id, &data, tries) {
            Ok(token) => Ok(Some(token)),
            Err(_) => {
                log::warn!("persisted token is corrupt, refetching");
                Ok(None)
            }
        }
    }

    /// Records the token a response carried. Fields the response omitted are
    /// merged from the persisted token; it is an error for a required field
    /// to be absent from both.
    pub async fn update_next(
        &self,
        data: &[u8],
        backup_id: Option<&[u8]>,
        tries: Option<u32>,
    ) -> Result<Token> {
        let persisted = self.current().await?;
        let backup_id = match backup_id {
            Some(backup_id) => backup_id.to_vec(),
            None => persisted
                .as_ref()
                .map(|token| token.backup_id().to_vec())
                .ok_or_else(|| Error::assert("no backup id to merge into the next token"))?,
        };
        let tries = tries
            .or_else(|| persisted.as_ref().map(Token::tries))
            .ok_or_else(|| Error::assert("no tries count to merge into the next token"))?;

        let token = Token::new(&backup_id, data, tries)?;
        self.write(&token).await?;
        Ok(token)
    }

    /// Parses and records the initial token from the enclave's bootstrap
    /// endpoint.
    pub async fn update_from_bootstrap(&self, body: &[u8]) -> Result<Token> {
        let parsed: BootstrapBody = serde_json::from_slice(body)?;
        let backup_id = BASE64_STANDARD
            .decode(&parsed.backup_id)
            .map_err(|_| Error::assert("bootstrap backup id is not base64"))?;
        let data = BASE64_STANDARD
            .decode(&parsed.token)
            .map_err(|_| Error::assert("bootstrap token is not base64"))?;

        let token = Token::new(&backup_id, &data, parsed.tries)?;
        self.write(&token).await?;
        Ok(token)
    }

    pub async fn clear_next(&self) -> Result<()> {
        self.store
            .write_batch(
                TOKEN_COLLECTION,
                vec![
                    (BACKUP_ID_KEY.to_string(), None),
                    (DATA_KEY.to_string(), None),
                    (TRIES_KEY.to_string(), None),
                ],
            )
            .await
            .map_err(Error::from)
    }

    async fn write(&self, token: &Token) -> std::result::Result<(), StoreError> {
        self.store
            .write_batch(
                TOKEN_COLLECTION,
                vec![
                    (
                        BACKUP_ID_KEY.to_string(),
                        Some(token.backup_id().to_vec()),
                    ),
                    (DATA_KEY.to_string(), Some(token.data().to_vec())),
                    (TRIES_KEY.to_string(), Some(encode_u32(token.tries()))),
                ],
            )
            .await
    }
}
