//! Error types for secure channel operations

use thiserror::Error;

use crate::keys::{KeyCipher, KeyType};

/// Result type for secure channel operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for secure channel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Key secret does not match the cipher's required length
    #[error("bad key length for {cipher}: {actual} bytes")]
    BadKeyLength {
        /// Cipher the key was constructed for
        cipher: KeyCipher,
        /// Length of the supplied secret
        actual: usize,
    },

    /// Required key type is absent from the key set
    #[error("key set has no {0} key")]
    KeyNotFound(KeyType),

    /// Key set construction or shape constraint violated
    #[error("invalid key set: {0}")]
    InvalidKeySet(&'static str),

    /// Diversification data or master key unsuitable for the scheme
    #[error("bad diversification input: {0}")]
    BadDiversificationInput(&'static str),

    /// Challenge or counter material has the wrong length
    #[error("bad challenge length: expected {expected}, got {actual}")]
    BadChallengeLength {
        /// Required length in bytes
        expected: usize,
        /// Length of the supplied material
        actual: usize,
    },

    /// Unrecognized protocol version / parameter byte combination
    #[error("unknown protocol variant: SCP{version:02} i={parameter:#04x}")]
    UnknownProtocolVariant {
        /// Advertised protocol major version
        version: u8,
        /// Advertised i-parameter byte
        parameter: u8,
    },

    /// Protocol variant rejected by the configured protocol policy
    #[error("protocol SCP{version:02} i={parameter:#04x} not allowed by policy")]
    ProtocolNotAllowed {
        /// Rejected protocol major version
        version: u8,
        /// Rejected i-parameter byte
        parameter: u8,
    },

    /// Protocol variant cannot provide the required protection level
    #[error("security level insufficient: {0}")]
    SecurityLevelInsufficient(&'static str),

    /// Response MAC verification failed; the session is no longer trustworthy
    #[error("response authentication failed")]
    ResponseAuthenticationFailed,

    /// Operation attempted on a session already in the broken state
    #[error("session is broken; a fresh authentication is required")]
    SessionBroken,

    /// Command data cannot be protected within a short APDU
    #[error("command data too long to wrap: {0} bytes")]
    DataTooLong(usize),

    /// Malformed response APDU
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(&'static str),
}
