//! Binary request/response framing.
//!
//! Every packet starts with a fixed 24-byte header:
//!
//! ```text
//! offset  0: magic      (1B, request 0x80 / response 0x81)
//! offset  1: opcode     (1B)
//! offset  2: key length (2B, big endian)
//! offset  4: extras len (1B)
//! offset  5: datatype   (1B)
//! offset  6: partition (request) / status (response) (2B, big endian)
//! offset  8: body length (4B, big endian; extras + key + value)
//! offset 12: opaque     (4B, echoed verbatim)
//! offset 16: cas        (8B, big endian)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::errors::ProtocolError;
use super::opcode::Opcode;
use super::status::Status;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 24;

/// Magic byte opening every request packet.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte opening every response packet.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// A validated request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub partition: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Parse and structurally validate a header from the first
    /// [`HEADER_LEN`] bytes of `buf`.
    ///
    /// `max_packet_size` bounds the body so a rogue peer cannot make the
    /// connection buffer unbounded amounts of data.
    pub fn parse(buf: &[u8], max_packet_size: u32) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                have: buf.len(),
                need: HEADER_LEN,
            });
        }
        if buf[0] != MAGIC_REQUEST {
            return Err(ProtocolError::InvalidMagic { byte: buf[0] });
        }
        let opcode = Opcode::from_u8(buf[1]).ok_or(ProtocolError::UnknownOpcode { byte: buf[1] })?;
        let key_len = u16::from_be_bytes([buf[2], buf[3]]);
        let extras_len = buf[4];
        let datatype = buf[5];
        let partition = u16::from_be_bytes([buf[6], buf[7]]);
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let opaque = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let cas = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if body_len > max_packet_size {
            return Err(ProtocolError::BodyTooLarge {
                body_len,
                max: max_packet_size,
            });
        }
        if u32::from(key_len) + u32::from(extras_len) > body_len {
            return Err(ProtocolError::InvalidFrame {
                reason: format!(
                    "key ({key_len}) + extras ({extras_len}) exceed body length {body_len}"
                ),
            });
        }
        Ok(Self {
            opcode,
            key_len,
            extras_len,
            datatype,
            partition,
            body_len,
            opaque,
            cas,
        })
    }

    /// Total packet size including the header.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }

    #[must_use]
    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.key_len as usize - self.extras_len as usize
    }
}

/// A complete parsed request: header plus its body segments.
#[derive(Clone, Debug)]
pub struct Request {
    pub header: RequestHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    /// Split a full frame (header + body) into its segments. The caller
    /// guarantees `frame.len() == header.frame_len()`.
    #[must_use]
    pub fn from_frame(header: RequestHeader, mut body: Bytes) -> Self {
        let extras = body.split_to(header.extras_len as usize);
        let key = body.split_to(header.key_len as usize);
        Self {
            header,
            extras,
            key,
            value: body,
        }
    }
}

/// A response ready for framing onto the wire.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub opcode: u8,
    pub status: Status,
    pub datatype: u8,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(opcode: Opcode, status: Status, opaque: u32) -> Self {
        Self {
            opcode: opcode.as_u8(),
            status,
            opaque,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[must_use]
    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Encode into a single contiguous frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(MAGIC_RESPONSE);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.status.as_u16());
        buf.put_u32(body_len as u32);
        buf.put_u32_le(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf.freeze()
    }
}
