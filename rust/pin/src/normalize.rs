//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use unicode_normalization::UnicodeNormalization;

/// Whether a pin consists of digits only.
///
/// Recorded when a pin is stored so re-entry can show the matching keyboard.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinType {
    Numeric = 1,
    Alphanumeric = 2,
}

impl PinType {
    /// Classifies `pin`, normalizing it first.
    pub fn for_pin(pin: &str) -> Self {
        let normalized = normalize_pin(pin);
        let digits: String = normalized.chars().filter(char::is_ascii_digit).collect();
        if normalized == digits {
            Self::Numeric
        } else {
            Self::Alphanumeric
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Numeric),
            2 => Some(Self::Alphanumeric),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Puts a user-entered pin into canonical form.
///
/// 1. Whitespace is removed.
/// 2. If every remaining character is a decimal digit, each is replaced with
///    its ASCII equivalent.
/// 3. The result is NFKD normalized.
///
/// Two renderings of what a user considers the same pin map to the same
/// canonical form, so the keys derived from it match across entries and
/// devices.
pub fn normalize_pin(pin: &str) -> String {
    let pin: String = pin.chars().filter(|c| !c.is_whitespace()).collect();

    let digit_values: Option<Vec<u32>> = pin.chars().map(decimal_digit_value).collect();
    let pin = match digit_values {
        Some(digits) if !pin.is_empty() => digits
            .into_iter()
            .map(|d| char::from_digit(d, 10).expect("value below ten"))
            .collect(),
        _ => pin,
    };

    pin.nfkd().collect()
}

/// Decimal value of `c` for any character in a Unicode `Nd` run.
///
/// `char::to_digit` only understands ASCII; pins typed on localized number
/// pads arrive as other scripts' digits. Covers the BMP digit blocks plus
/// the fullwidth forms.
fn decimal_digit_value(c: char) -> Option<u32> {
    const BLOCK_ZEROS: &[u32] = &[
        0x0030, // ASCII
        0x0660, // Arabic-Indic
        0x06F0, // Extended Arabic-Indic
        0x07C0, // NKo
        0x0966, // Devanagari
        0x09E6, // Bengali
        0x0A66, // Gurmukhi
        0x0AE6, // Gujarati
        0x0B66, // Oriya
        0x0BE6, // Tamil
        0x0C66, // Telugu
        0x0CE6, // Kannada
        0x0D66, // Malayalam
        0x0DE6, // Sinhala Lith
        0x0E50, // Thai
        0x0ED0, // Lao
        0x0F20, // Tibetan
        0x1040, // Myanmar
        0x1090, // Myanmar Shan
        0x17E0, // Khmer
        0x1810, // Mongolian
        0x1946, // Limbu
        0x19D0, // New Tai Lue
        0x1A80, // Tai Tham Hora
        0x1A90, // Tai Tham Tham
        0x1B50, // Balinese
        0x1BB0, // Sundanese
        0x1C40, // Lepcha
        0x1C50, // Ol Chiki
        0xA620, // Vai
        0xA8D0, // Saurashtra
        0xA900, // Kayah Li
        0xA9D0, // Javanese
        0xA9F0, // Myanmar Tai Laing
        0xAA50, // Cham
        0xABF0, // Meetei Mayek
        0xFF10, // Fullwidth
    ];

    let cp = c as u32;
    BLOCK_ZEROS
        .iter()
        .find(|zero| (**zero..**zero + 10).contains(&cp))
        .map(|zero| cp - zero)
}
