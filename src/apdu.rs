//! Command and response APDU value types
//!
//! The wrapper consumes and produces plain ISO/IEC 7816-4 short APDUs.
//! Transport, chaining and status word interpretation live outside this
//! crate; these types only carry the wire shape.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Command APDU with a 4-byte header, optional data field and optional Le
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected response length (optional)
    pub le: Option<u8>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: None,
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Command data length (Lc), zero when no data field is present
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    /// Serialize to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(4 + 1 + self.data_len() + 1);

        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if let Some(data) = &self.data {
            buffer.put_u8(data.len() as u8);
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            buffer.put_u8(le);
        }

        buffer.freeze()
    }
}

/// Response APDU: data field followed by the two status word bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response data field
    pub data: Bytes,
    /// First status word byte
    pub sw1: u8,
    /// Second status word byte
    pub sw2: u8,
}

impl Response {
    /// Parse a response from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidResponse("shorter than a status word"));
        }

        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            data: Bytes::copy_from_slice(data),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    /// Status word as a single 16-bit value
    pub const fn status(&self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    /// Whether the status word indicates success (0x9000)
    pub const fn is_success(&self) -> bool {
        self.status() == 0x9000
    }

    /// Serialize to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.data.len() + 2);
        buffer.put_slice(&self.data);
        buffer.put_u8(self.sw1);
        buffer.put_u8(self.sw2);
        buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_command_to_bytes() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00);
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00a40400"));

        let cmd = Command::new_with_data(0x80, 0xE4, 0x00, 0x80, hex!("4f00").to_vec());
        assert_eq!(cmd.to_bytes().as_ref(), hex!("80e40080024f00"));

        let cmd = Command::new(0x80, 0xCA, 0x00, 0x00).with_le(0);
        assert_eq!(cmd.to_bytes().as_ref(), hex!("80ca000000"));
    }

    #[test]
    fn test_response_from_bytes() {
        let response = Response::from_bytes(&hex!("6f109000")).unwrap();
        assert_eq!(response.data.as_ref(), hex!("6f10"));
        assert_eq!(response.status(), 0x9000);
        assert!(response.is_success());
        assert_eq!(response.to_bytes().as_ref(), hex!("6f109000"));

        let response = Response::from_bytes(&hex!("6a82")).unwrap();
        assert!(response.data.is_empty());
        assert!(!response.is_success());

        assert!(Response::from_bytes(&hex!("90")).is_err());
    }
}
