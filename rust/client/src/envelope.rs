//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Deterministic authenticated encryption of the master key.
//!
//! An SIV construction built from HMAC-SHA-256: the 16 byte synthetic IV
//! doubles as the authenticator, and the key stream is the HMAC of the IV
//! under a second subkey. Determinism is deliberate — re-backing up an
//! unchanged master key under an unchanged pin produces an identical record,
//! so the server cannot tell the two apart.

use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::keys::{hmac_sha256, MASTER_KEY_LEN};

/// Length of a sealed master key: 16 byte IV followed by 32 bytes of
/// ciphertext.
pub const ENVELOPE_LEN: usize = 48;

const IV_LEN: usize = 16;
const AUTH_SUBKEY_LABEL: &[u8] = b"auth";
const ENC_SUBKEY_LABEL: &[u8] = b"enc";

/// Seals `master_key` under `encryption_key`. Same inputs, same output.
pub fn seal(
    master_key: &[u8; MASTER_KEY_LEN],
    encryption_key: &[u8; 32],
) -> [u8; ENVELOPE_LEN] {
    let auth_key = hmac_sha256(encryption_key, AUTH_SUBKEY_LABEL);
    let enc_key = hmac_sha256(encryption_key, ENC_SUBKEY_LABEL);

    let iv: [u8; IV_LEN] = hmac_sha256(&auth_key, master_key)[..IV_LEN]
        .try_into()
        .expect("sliced to length");
    let key_stream = hmac_sha256(&enc_key, &iv);

    let mut envelope = [0u8; ENVELOPE_LEN];
    envelope[..IV_LEN].copy_from_slice(&iv);
    for (out, (stream, plain)) in envelope[IV_LEN..]
        .iter_mut()
        .zip(key_stream.iter().zip(master_key.iter()))
    {
        *out = stream ^ plain;
    }
    envelope
}

/// Opens an envelope produced by [`seal`], verifying the synthetic IV in
/// constant time.
pub fn open(envelope: &[u8], encryption_key: &[u8; 32]) -> Result<[u8; MASTER_KEY_LEN]> {
    if envelope.len() != ENVELOPE_LEN {
        return Err(Error::assert(format!(
            "envelope must be {ENVELOPE_LEN} bytes, got {}",
            envelope.len()
        )));
    }
    let (iv, ciphertext) = envelope.split_at(IV_LEN);

    let auth_key = hmac_sha256(encryption_key, AUTH_SUBKEY_LABEL);
    let enc_key = hmac_sha256(encryption_key, ENC_SUBKEY_LABEL);
    let key_stream = hmac_sha256(&enc_key, iv);

    let mut master_key = [0u8; MASTER_KEY_LEN];
    for (out, (stream, cipher)) in master_key
        .iter_mut()
        .zip(key_stream.iter().zip(ciphertext.iter()))
    {
        *out = stream ^ cipher;
    }

    let expected_iv = hmac_sha256(&auth_key, &master_key);
    if !bool::from(expected_iv[..IV_LEN].ct_eq(iv)) {
        return Err(Error::assert("envelope failed authentication"));
    }
    Ok(master_key)
}
