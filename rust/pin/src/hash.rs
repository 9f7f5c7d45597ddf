//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Pin stretching for the key backup service.
//!
//! Two mechanisms live here:
//!   1. [`PinHash`] runs a pin through Argon2 and splits the output into the
//!      password the backup enclave sees and the key that wraps the master
//!      key. The enclave can rate-limit guesses but never learns either the
//!      pin or the wrapping key.
//!   2. [`local_pin_hash`] produces a
//!      [PHC-string encoded](https://github.com/P-H-C/phc-string-format/blob/master/phc-sf-spec.md#specification)
//!      hash of the pin for storing locally and re-checking the pin offline.
//!
//! Pins are UTF-8 encoded bytes that must be run through
//! [`crate::normalize_pin`] *before* being provided to these functions.

use argon2::password_hash::{rand_core, Salt, SaltString};
use argon2::{
    Algorithm, Argon2, ParamsBuilder, PasswordHash, PasswordHasher, PasswordVerifier, Version,
};

use crate::error::Result;

/// Length of the salt for [`PinHash::create`]: the backup id of the enclave
/// record.
pub const PIN_HASH_SALT_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct PinHash {
    /// Wraps the master key before it is uploaded to the backup enclave.
    /// The 32 byte prefix of the 64 byte hashed pin. Never sent anywhere.
    pub encryption_key: [u8; 32],

    /// The password presented to the backup enclave to access the record.
    /// The 32 byte suffix of the 64 byte hashed pin.
    pub access_key: [u8; 32],
}

impl PinHash {
    /// Hashes a pin into the encryption key and access key used with the
    /// backup enclave.
    ///
    /// # Arguments
    /// * `pin` - UTF-8 encoding of the pin. The pin *must* be normalized first.
    /// * `backup_id` - The 32 byte id of the user's record with the enclave,
    ///   used as the salt
    pub fn create(pin: &[u8], backup_id: &[u8; PIN_HASH_SALT_LEN]) -> Result<PinHash> {
        let hasher = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            ParamsBuilder::new()
                .m_cost(1024 * 16) // 16 MiB
                .p_cost(1)
                .t_cost(32)
                .output_len(64)
                .build()
                .expect("valid params"),
        );
        let mut output_key_material = [0u8; 64];
        hasher.hash_password_into(pin, backup_id, &mut output_key_material)?;
        Ok(PinHash {
            encryption_key: output_key_material[..32]
                .try_into()
                .expect("target length 32"),
            access_key: output_key_material[32..]
                .try_into()
                .expect("target length 32"),
        })
    }
}

/// Creates a PHC encoded password hash string. This string may be verified
/// later with [`verify_local_pin_hash`].
///
/// # Arguments
/// * `pin` - UTF-8 encoding of the pin. The pin *must* be normalized first.
pub fn local_pin_hash(pin: &[u8]) -> Result<String> {
    static_assertions::const_assert_eq!(Salt::RECOMMENDED_LENGTH, 16);
    let salt = SaltString::generate(&mut rand_core::OsRng);
    local_pin_hash_with_salt(pin, &salt)
}

fn local_pin_hash_with_salt<'a>(pin: &[u8], salt: impl Into<Salt<'a>>) -> Result<String> {
    let hasher = Argon2::new(
        Algorithm::Argon2i,
        Version::V0x13,
        ParamsBuilder::new()
            .m_cost(512)
            .p_cost(1)
            .t_cost(64)
            .output_len(32)
            .build()
            .expect("valid params"),
    );
    let hash = hasher.hash_password(pin, salt)?;
    Ok(hash.to_string())
}

/// Verifies an encoded password hash against a pin.
///
/// Hash mismatch is `Ok(false)`; an error means `encoded_hash` did not parse.
///
/// # Arguments
/// * `pin` - UTF-8 encoding of the pin. The pin *must* be normalized first.
/// * `encoded_hash` - A PHC-string formatted representation of the hash, as
///   returned by [`local_pin_hash`]
pub fn verify_local_pin_hash(encoded_hash: &str, pin: &[u8]) -> Result<bool> {
    let parsed = PasswordHash::new(encoded_hash)?;
    Ok(Argon2::default().verify_password(pin, &parsed).is_ok())
}
