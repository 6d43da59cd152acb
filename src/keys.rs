//! Key material model
//!
//! Immutable key and key set value types shared by the diversification,
//! session derivation and wrapping engines. Secrets are wiped on drop.

use std::fmt;

use zeroize::Zeroize;

use crate::{Error, Result, crypto};

/// Block cipher a key is intended for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCipher {
    /// Single DES (8-byte secret)
    Des,
    /// Triple DES (16- or 24-byte secret)
    Des3,
    /// AES (16-, 24- or 32-byte secret)
    Aes,
}

impl KeyCipher {
    /// Valid secret lengths for this cipher, in bytes
    pub const fn valid_lengths(self) -> &'static [usize] {
        match self {
            Self::Des => &[8],
            Self::Des3 => &[16, 24],
            Self::Aes => &[16, 24, 32],
        }
    }

    /// Cipher block size in bytes
    pub const fn block_size(self) -> usize {
        match self {
            Self::Des | Self::Des3 => 8,
            Self::Aes => 16,
        }
    }
}

impl fmt::Display for KeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Des => f.write_str("DES"),
            Self::Des3 => f.write_str("3DES"),
            Self::Aes => f.write_str("AES"),
        }
    }
}

/// Role of a key within a key set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Command encryption key
    Enc,
    /// Command MAC key
    Mac,
    /// Key encryption key (DEK)
    Kek,
    /// Response MAC key
    Rmac,
}

impl KeyType {
    /// GlobalPlatform key-purpose identifier, as used in diversification
    /// patterns and key identifiers on the card
    pub const fn purpose_id(self) -> u8 {
        match self {
            Self::Enc => 0x01,
            Self::Mac => 0x02,
            Self::Kek => 0x03,
            Self::Rmac => 0x07,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enc => f.write_str("ENC"),
            Self::Mac => f.write_str("MAC"),
            Self::Kek => f.write_str("KEK"),
            Self::Rmac => f.write_str("RMAC"),
        }
    }
}

/// An immutable key: secret bytes plus type, cipher, version and id
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    key_type: KeyType,
    cipher: KeyCipher,
    version: u8,
    id: u8,
    secret: Vec<u8>,
}

impl Key {
    /// Create a key from explicit secret bytes
    ///
    /// Fails with [`Error::BadKeyLength`] if the secret length does not
    /// match one of the cipher's valid lengths.
    pub fn new(
        key_type: KeyType,
        cipher: KeyCipher,
        version: u8,
        id: u8,
        secret: &[u8],
    ) -> Result<Self> {
        if !cipher.valid_lengths().contains(&secret.len()) {
            return Err(Error::BadKeyLength {
                cipher,
                actual: secret.len(),
            });
        }

        Ok(Self {
            key_type,
            cipher,
            version,
            id,
            secret: secret.to_vec(),
        })
    }

    /// Key role within its key set
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Cipher the key is intended for
    pub const fn cipher(&self) -> KeyCipher {
        self.cipher
    }

    /// Key version number
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Key identifier
    pub const fn id(&self) -> u8 {
        self.id
    }

    /// Secret key bytes
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Key check value: the first 3 bytes of encrypting a reference block
    ///
    /// DES and 3DES keys encrypt an all-zero block, AES keys an all-one
    /// block. Used for human verification of key entry, not for security.
    pub fn check_value(&self) -> Result<[u8; 3]> {
        crypto::key_check_value(self.cipher, &self.secret)
    }
}

impl fmt::Debug for Key {
    // Secrets never appear in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_type", &self.key_type)
            .field("cipher", &self.cipher)
            .field("version", &self.version)
            .field("id", &self.id)
            .field("len", &self.secret.len())
            .finish()
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// An ordered set of keys, at most one per type, sharing one version
#[derive(Debug, Clone)]
pub struct KeySet {
    version: u8,
    keys: Vec<Key>,
}

impl KeySet {
    /// Build a key set from an ordered collection of keys
    ///
    /// Fails with [`Error::InvalidKeySet`] if two keys share a type or
    /// the versions are not uniform.
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Result<Self> {
        let keys: Vec<Key> = keys.into_iter().collect();

        let Some(first) = keys.first() else {
            return Err(Error::InvalidKeySet("key set is empty"));
        };
        let version = first.version();

        for (i, key) in keys.iter().enumerate() {
            if key.version() != version {
                return Err(Error::InvalidKeySet("mixed key versions"));
            }
            if keys[..i].iter().any(|k| k.key_type() == key.key_type()) {
                return Err(Error::InvalidKeySet("duplicate key type"));
            }
        }

        Ok(Self { version, keys })
    }

    /// The version shared by all keys in the set
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// All keys, in insertion order
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Look up a key by type
    pub fn get(&self, key_type: KeyType) -> Option<&Key> {
        self.keys.iter().find(|k| k.key_type() == key_type)
    }

    /// Look up a key by type, failing with [`Error::KeyNotFound`]
    pub fn key(&self, key_type: KeyType) -> Result<&Key> {
        self.get(key_type).ok_or(Error::KeyNotFound(key_type))
    }

    /// The well-known GlobalPlatform test key set (`404142...4f`)
    ///
    /// ENC, MAC and KEK keys all carry the reference secret. Only useful
    /// for interoperability testing against freshly issued cards.
    pub fn global_platform_test(cipher: KeyCipher) -> Self {
        const SECRET: [u8; 16] = [
            0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4c, 0x4d,
            0x4e, 0x4f,
        ];

        let keys = [KeyType::Enc, KeyType::Mac, KeyType::Kek]
            .into_iter()
            .map(|t| Key {
                key_type: t,
                cipher,
                version: 0,
                id: t.purpose_id(),
                secret: SECRET.to_vec(),
            })
            .collect();

        Self { version: 0, keys }
    }
}
