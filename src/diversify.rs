//! Master key diversification
//!
//! Derives per-card static keys from a master key set and the 10 bytes of
//! key diversification data read from the card. Schemes are not
//! interchangeable: a set diversified under one scheme must never be
//! diversified again under another.

use std::fmt;

use crate::keys::{Key, KeyCipher, KeySet};
use crate::{Error, Result, crypto};

/// Diversification data reported by the card, 10 bytes
pub const DIVERSIFICATION_DATA_LENGTH: usize = 10;

/// Named master key diversification schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversificationScheme {
    /// EMV CPS 1.1 derivation
    Emv,
    /// Visa2 derivation
    Visa2,
}

impl fmt::Display for DiversificationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emv => f.write_str("EMV"),
            Self::Visa2 => f.write_str("VISA2"),
        }
    }
}

impl DiversificationScheme {
    /// Build the 16-byte derivation pattern for one key purpose
    fn fill(self, data: &[u8], purpose_id: u8) -> [u8; 16] {
        let mut block = [0u8; 16];
        match self {
            Self::Emv => {
                block[..6].copy_from_slice(&data[4..10]);
                block[6] = 0xF0;
                block[7] = purpose_id;
                block[8..14].copy_from_slice(&data[4..10]);
                block[14] = 0x0F;
                block[15] = purpose_id;
            }
            Self::Visa2 => {
                block[..2].copy_from_slice(&data[..2]);
                block[2..6].copy_from_slice(&data[4..8]);
                block[6] = 0xF0;
                block[7] = purpose_id;
                block[8..10].copy_from_slice(&data[..2]);
                block[10..14].copy_from_slice(&data[4..8]);
                block[14] = 0x0F;
                block[15] = purpose_id;
            }
        }
        block
    }
}

/// Diversify a master key set for one card
///
/// Pure function: every key in the output retains the type, cipher,
/// version and id of its master but carries a secret derived by
/// encrypting the scheme's fill pattern with 3DES-ECB under the master
/// key. Requires 10 bytes of diversification data and 16-byte DES3
/// master keys.
pub fn diversify(
    master: &KeySet,
    scheme: DiversificationScheme,
    data: &[u8],
) -> Result<KeySet> {
    if data.len() != DIVERSIFICATION_DATA_LENGTH {
        return Err(Error::BadDiversificationInput(
            "diversification data must be 10 bytes",
        ));
    }

    let mut diversified = Vec::with_capacity(master.keys().len());
    for key in master.keys() {
        if key.cipher() != KeyCipher::Des3 || key.secret().len() != 16 {
            return Err(Error::BadDiversificationInput(
                "diversification requires 16-byte 3DES master keys",
            ));
        }

        let mut block = scheme.fill(data, key.key_type().purpose_id());
        crypto::des3_encrypt_ecb(key.secret(), &mut block)?;
        diversified.push(Key::new(
            key.key_type(),
            key.cipher(),
            key.version(),
            key.id(),
            &block,
        )?);
    }

    KeySet::new(diversified)
}
