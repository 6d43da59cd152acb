//! Protocol descriptor decoding and policy enforcement
//!
//! The card advertises its secure channel variant as a (version,
//! i-parameter) byte pair. Decoding turns that pair into a structured
//! capability set; policies then decide whether the host is willing to
//! operate the variant at all, and whether it can provide the required
//! protection level. Both checks run before any key material is derived.

use std::fmt;

use crate::{Error, Result};

/// Secure channel protocol major version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScpVersion {
    /// SCP01 (DES3, legacy)
    Scp01,
    /// SCP02 (DES3)
    Scp02,
    /// SCP03 (AES)
    Scp03,
}

impl ScpVersion {
    /// The version byte as advertised by the card
    pub const fn number(self) -> u8 {
        match self {
            Self::Scp01 => 1,
            Self::Scp02 => 2,
            Self::Scp03 => 3,
        }
    }

    /// Decode the version byte advertised by the card
    pub const fn from_number(version: u8) -> Option<Self> {
        match version {
            1 => Some(Self::Scp01),
            2 => Some(Self::Scp02),
            3 => Some(Self::Scp03),
            _ => None,
        }
    }
}

impl fmt::Display for ScpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCP{:02}", self.number())
    }
}

/// A decoded secure channel variant: version plus capability flags
///
/// Built only via [`ProtocolDescriptor::decode`]; unrecognized
/// (version, parameter) combinations are rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    version: ScpVersion,
    parameter: u8,
    three_keys: bool,
    cmac_on_unmodified_apdu: bool,
    explicit_initiation: bool,
    icv_mac_over_aid: bool,
    icv_encryption: bool,
    rmac_support: bool,
    renc_support: bool,
    pseudo_random_challenge: bool,
}

impl ProtocolDescriptor {
    /// Decode the (version, i-parameter) pair advertised by the card
    ///
    /// SCP01 defines exactly i=0x05 and i=0x15. SCP02 i-parameter bits
    /// follow the card specification (bit 0x80 is reserved and
    /// rejected). SCP03 allows the pseudo-random challenge, R-MAC and
    /// R-ENC bits only; a card omitting the parameter altogether is the
    /// legacy i=0x00 variant. Everything else fails with
    /// [`Error::UnknownProtocolVariant`].
    pub fn decode(version: u8, parameter: u8) -> Result<Self> {
        let unknown = Error::UnknownProtocolVariant { version, parameter };

        match ScpVersion::from_number(version).ok_or(unknown)? {
            ScpVersion::Scp01 => {
                if parameter != 0x05 && parameter != 0x15 {
                    return Err(Error::UnknownProtocolVariant { version, parameter });
                }
                Ok(Self {
                    version: ScpVersion::Scp01,
                    parameter,
                    three_keys: true,
                    cmac_on_unmodified_apdu: false,
                    explicit_initiation: true,
                    icv_mac_over_aid: false,
                    icv_encryption: parameter & 0x10 != 0,
                    rmac_support: false,
                    renc_support: false,
                    pseudo_random_challenge: false,
                })
            }
            ScpVersion::Scp02 => {
                if parameter & 0x80 != 0 {
                    return Err(Error::UnknownProtocolVariant { version, parameter });
                }
                Ok(Self {
                    version: ScpVersion::Scp02,
                    parameter,
                    three_keys: parameter & 0x01 != 0,
                    cmac_on_unmodified_apdu: parameter & 0x02 != 0,
                    explicit_initiation: parameter & 0x04 != 0,
                    icv_mac_over_aid: parameter & 0x08 != 0,
                    icv_encryption: parameter & 0x10 != 0,
                    rmac_support: parameter & 0x20 != 0,
                    renc_support: false,
                    pseudo_random_challenge: parameter & 0x40 != 0,
                })
            }
            ScpVersion::Scp03 => {
                // Only the pseudo-random, R-MAC and R-ENC bits are
                // defined; R-ENC requires R-MAC
                if parameter & !0x70 != 0 || (parameter & 0x40 != 0 && parameter & 0x20 == 0) {
                    return Err(Error::UnknownProtocolVariant { version, parameter });
                }
                Ok(Self {
                    version: ScpVersion::Scp03,
                    parameter,
                    three_keys: true,
                    cmac_on_unmodified_apdu: false,
                    explicit_initiation: true,
                    icv_mac_over_aid: false,
                    icv_encryption: false,
                    rmac_support: parameter & 0x20 != 0,
                    renc_support: parameter & 0x40 != 0,
                    pseudo_random_challenge: parameter & 0x10 != 0,
                })
            }
        }
    }

    /// Protocol major version
    pub const fn version(&self) -> ScpVersion {
        self.version
    }

    /// The i-parameter byte exactly as decoded
    pub const fn parameter(&self) -> u8 {
        self.parameter
    }

    /// Re-encode the i-parameter byte from the capability flags
    pub const fn encode_parameter(&self) -> u8 {
        match self.version {
            ScpVersion::Scp01 => {
                if self.icv_encryption {
                    0x15
                } else {
                    0x05
                }
            }
            ScpVersion::Scp02 => {
                (self.three_keys as u8)
                    | (self.cmac_on_unmodified_apdu as u8) << 1
                    | (self.explicit_initiation as u8) << 2
                    | (self.icv_mac_over_aid as u8) << 3
                    | (self.icv_encryption as u8) << 4
                    | (self.rmac_support as u8) << 5
                    | (self.pseudo_random_challenge as u8) << 6
            }
            ScpVersion::Scp03 => {
                (self.pseudo_random_challenge as u8) << 4
                    | (self.rmac_support as u8) << 5
                    | (self.renc_support as u8) << 6
            }
        }
    }

    /// Whether the variant uses three distinct secure channel keys
    pub const fn three_keys(&self) -> bool {
        self.three_keys
    }

    /// Whether the C-MAC is computed on the unmodified APDU (SCP02)
    pub const fn cmac_on_unmodified_apdu(&self) -> bool {
        self.cmac_on_unmodified_apdu
    }

    /// Whether channel initiation is explicit (EXTERNAL AUTHENTICATE)
    pub const fn explicit_initiation(&self) -> bool {
        self.explicit_initiation
    }

    /// Whether the first ICV is a MAC over the application AID (SCP02)
    pub const fn icv_mac_over_aid(&self) -> bool {
        self.icv_mac_over_aid
    }

    /// Whether the ICV is encrypted between commands (SCP01/SCP02)
    pub const fn icv_encryption(&self) -> bool {
        self.icv_encryption
    }

    /// Whether the variant can MAC responses
    pub const fn supports_rmac(&self) -> bool {
        self.rmac_support
    }

    /// Whether the variant can encrypt responses (SCP03)
    pub const fn supports_renc(&self) -> bool {
        self.renc_support
    }

    /// Whether the card challenge is pseudo-random and predictable
    pub const fn pseudo_random_challenge(&self) -> bool {
        self.pseudo_random_challenge
    }

    /// Whether the variant can encrypt commands
    ///
    /// Implicitly initiated channels carry C-MAC only.
    pub const fn supports_encryption(&self) -> bool {
        self.explicit_initiation
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} i={:#04x}", self.version, self.parameter)
    }
}

/// Allow-set of secure channel variants the host is willing to operate
///
/// Version-scoped policies accept exactly the parameter bytes that
/// decode for that version; unknown parameter bytes never reach a
/// policy because decoding already rejected them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPolicy {
    /// Any variant that decodes
    Any,
    /// A single protocol version, any decodable parameter
    Version(ScpVersion),
    /// Exactly one (version, parameter) combination
    Exact {
        /// Required protocol version
        version: ScpVersion,
        /// Required i-parameter byte
        parameter: u8,
    },
}

impl ProtocolPolicy {
    /// Accept any decodable variant
    pub const PERMISSIVE: Self = Self::Any;
    /// Accept SCP01 only
    pub const SCP01: Self = Self::Version(ScpVersion::Scp01);
    /// Accept SCP02 only
    pub const SCP02: Self = Self::Version(ScpVersion::Scp02);
    /// Accept SCP03 only
    pub const SCP03: Self = Self::Version(ScpVersion::Scp03);

    /// Check a decoded descriptor against the policy
    pub fn check_protocol(&self, descriptor: &ProtocolDescriptor) -> Result<()> {
        let allowed = match *self {
            Self::Any => true,
            Self::Version(version) => descriptor.version() == version,
            Self::Exact { version, parameter } => {
                descriptor.version() == version && descriptor.parameter() == parameter
            }
        };

        if !allowed {
            return Err(Error::ProtocolNotAllowed {
                version: descriptor.version().number(),
                parameter: descriptor.parameter(),
            });
        }
        Ok(())
    }
}

/// Minimum protection level the host requires for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityPolicy {
    /// Command MACs only
    CMac,
    /// Command MACs and command encryption
    CMacEnc,
    /// Command MACs, command encryption and response MACs
    CMacEncRMac,
}

impl SecurityPolicy {
    /// Whether the policy demands command encryption
    pub const fn requires_encryption(self) -> bool {
        !matches!(self, Self::CMac)
    }

    /// Whether the policy demands response MACs
    pub const fn requires_rmac(self) -> bool {
        matches!(self, Self::CMacEncRMac)
    }

    /// Check that a variant can provide the required protection
    pub fn check_protocol(self, descriptor: &ProtocolDescriptor) -> Result<()> {
        if self.requires_encryption() && !descriptor.supports_encryption() {
            return Err(Error::SecurityLevelInsufficient(
                "variant cannot encrypt commands",
            ));
        }
        if self.requires_rmac() && !descriptor.supports_rmac() {
            return Err(Error::SecurityLevelInsufficient(
                "variant cannot authenticate responses",
            ));
        }
        Ok(())
    }
}
