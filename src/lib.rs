//! GlobalPlatform secure channel engine
//!
//! Host-side building blocks for the GlobalPlatform secure channel
//! protocols SCP01, SCP02 and SCP03: key material modelling, master key
//! diversification, session key derivation and stateful APDU wrapping.
//! The crate is transport-agnostic; the caller performs the actual
//! exchange with the card and feeds challenges, sequence counters and
//! responses into the pure derivation functions and the
//! [`SecureChannelWrapper`].
//!
//! A typical session, after the authentication exchange completed:
//!
//! ```
//! use gp_secure_channel::{
//!     Command, KeyCipher, KeySet, ProtocolDescriptor, SecureChannelWrapper, SecurityPolicy,
//!     derive_scp02_session_keys,
//! };
//!
//! # fn main() -> gp_secure_channel::Result<()> {
//! let static_keys = KeySet::global_platform_test(KeyCipher::Des3);
//! let session_keys = derive_scp02_session_keys(&static_keys, &[0x00, 0x00])?;
//!
//! let protocol = ProtocolDescriptor::decode(2, 0x15)?;
//! let mut wrapper = SecureChannelWrapper::new(session_keys, protocol, SecurityPolicy::CMac)?;
//!
//! let wrapped = wrapper.wrap(&Command::new(0x80, 0xF2, 0x80, 0x02))?;
//! assert_eq!(wrapped.cla, 0x84);
//! # Ok(())
//! # }
//! ```

pub mod apdu;
pub mod crypto;
pub mod diversify;
mod error;
pub mod keys;
pub mod protocol;
pub mod session;
pub mod wrapper;

pub use apdu::{Command, Response};
pub use diversify::{DIVERSIFICATION_DATA_LENGTH, DiversificationScheme, diversify};
pub use error::{Error, Result};
pub use keys::{Key, KeyCipher, KeySet, KeyType};
pub use protocol::{ProtocolDescriptor, ProtocolPolicy, ScpVersion, SecurityPolicy};
pub use session::{
    derive_scp01_session_keys, derive_scp02_session_keys, derive_scp03_session_keys,
};
pub use wrapper::{CLA_SECURE_MESSAGING, SecureChannelWrapper, SessionState};
