//! Wire message header.
//!
//! Every message carried by the transport starts with a fixed 20-byte
//! little-endian header. The engine only interprets enough of it to
//! validate inbound requests and frame outbound replies; payload semantics
//! belong to the registered handler.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Message header size in bytes.
pub const MSG_HDR_SIZE: usize = 20;

/// Magic number for valid messages.
pub const MSG_MAGIC: u32 = 0x5343_5052;

/// Wire protocol version.
pub const MSG_VERSION: u8 = 1;

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Inbound call request.
    Request = 0,
    /// Outbound call reply.
    Reply = 1,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MsgType::Request),
            1 => Ok(MsgType::Reply),
            _ => Err(Error::InvalidMsgType(value)),
        }
    }
}

/// Message header (20 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       4     magic
/// 4       1     version
/// 5       1     msg_type
/// 6       2     reserved
/// 8       4     opcode
/// 12      4     status (i32)
/// 16      4     body_len
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message type.
    pub mtype: MsgType,
    /// Application-defined operation code.
    pub opc: u32,
    /// Status code (zero on requests; reply status on replies).
    pub status: i32,
    /// Length of the body following the header.
    pub body_len: u32,
}

impl MsgHeader {
    /// Create a request header.
    pub fn request(opc: u32, body_len: u32) -> Self {
        Self {
            mtype: MsgType::Request,
            opc,
            status: 0,
            body_len,
        }
    }

    /// Create a reply header.
    pub fn reply(opc: u32, status: i32, body_len: u32) -> Self {
        Self {
            mtype: MsgType::Reply,
            opc,
            status,
            body_len,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(MSG_MAGIC);
        buf.put_u8(MSG_VERSION);
        buf.put_u8(self.mtype as u8);
        buf.put_u16_le(0);
        buf.put_u32_le(self.opc);
        buf.put_i32_le(self.status);
        buf.put_u32_le(self.body_len);
    }

    /// Decode and validate a header from the front of `bytes`.
    ///
    /// Checks magic, version, type byte, and that the declared body length
    /// fits inside the slice.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MSG_HDR_SIZE {
            return Err(Error::Truncated {
                need: MSG_HDR_SIZE,
                got: bytes.len(),
            });
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MSG_MAGIC {
            return Err(Error::InvalidMagic {
                expected: MSG_MAGIC,
                got: magic,
            });
        }

        let version = bytes[4];
        if version != MSG_VERSION {
            return Err(Error::InvalidVersion(version));
        }

        let mtype = MsgType::try_from(bytes[5])?;
        let opc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let status = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let body_len = u32::from_le_bytes(bytes[16..20].try_into().unwrap());

        let need = MSG_HDR_SIZE + body_len as usize;
        if bytes.len() < need {
            return Err(Error::Truncated {
                need,
                got: bytes.len(),
            });
        }

        Ok(Self {
            mtype,
            opc,
            status,
            body_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = MsgHeader::request(42, 4);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);
        buf.extend_from_slice(b"ping");

        let decoded = MsgHeader::read_from(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.body_len, 4);
    }

    #[test]
    fn test_reply_header_carries_status() {
        let hdr = MsgHeader::reply(7, -22, 0);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);

        let decoded = MsgHeader::read_from(&buf).unwrap();
        assert_eq!(decoded.mtype, MsgType::Reply);
        assert_eq!(decoded.status, -22);
    }

    #[test]
    fn test_bad_magic() {
        let hdr = MsgHeader::request(1, 0);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);
        buf[0] ^= 0xFF;

        assert!(matches!(
            MsgHeader::read_from(&buf),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let err = MsgHeader::read_from(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, Error::Truncated { need, got: 5 } if need == MSG_HDR_SIZE));
    }

    #[test]
    fn test_truncated_body() {
        let hdr = MsgHeader::request(1, 100);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);
        buf.extend_from_slice(b"short");

        assert!(matches!(
            MsgHeader::read_from(&buf),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_type_byte() {
        let hdr = MsgHeader::request(1, 0);
        let mut buf = BytesMut::new();
        hdr.write_to(&mut buf);
        buf[5] = 9;

        assert!(matches!(
            MsgHeader::read_from(&buf),
            Err(Error::InvalidMsgType(9))
        ));
    }
}
