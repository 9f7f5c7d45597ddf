//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! PIN handling for the key backup service.
//!
//! Everything here is CPU-bound and free of I/O. A pin passes through
//! [`normalize_pin`] exactly once, after which [`PinHash`] stretches it into
//! the keys the backup service works with, and [`local_pin_hash`] /
//! [`verify_local_pin_hash`] cover offline re-verification.

mod error;
mod hash;
mod normalize;

pub use error::{Error, Result};
pub use hash::{local_pin_hash, verify_local_pin_hash, PinHash};
pub use normalize::{normalize_pin, PinType};
