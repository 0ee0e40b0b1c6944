//! Fixed-size framing shared by every message on the wire.
//!
//! Each message starts with an 8-byte preamble:
//!
//! - 1 byte: protocol version (always 2)
//! - 1 byte: message type (info or data message)
//! - 6 bytes: body length (big-endian, 48 bits)
//!
//! Data messages follow the preamble with a 22-byte [`MessageHeader`], then
//! `n_fields` fields and `n_ops` operations. All multi-byte integers are
//! big-endian. Reads go through bounds-checked helpers instead of
//! reinterpreting the buffer.

use crate::error::{Error, Result};

pub const PROTO_VERSION: u8 = 2;
pub const PROTO_TYPE_INFO: u8 = 1;
pub const PROTO_TYPE_MESSAGE: u8 = 3;

pub const PREAMBLE_SIZE: usize = 8;
pub const MESSAGE_HEADER_SIZE: usize = 22;
/// Preamble plus message header: what the executor reads before the body.
pub const FULL_HEADER_SIZE: usize = PREAMBLE_SIZE + MESSAGE_HEADER_SIZE;

/// Field header: 4-byte size plus 1-byte type.
pub const FIELD_HEADER_SIZE: usize = 5;
/// Op header: 4-byte size, op, particle type, version, name length.
pub const OP_HEADER_SIZE: usize = 8;

/// Largest body length the 48-bit size can describe.
pub const MAX_BODY_SIZE: u64 = (1 << 48) - 1;

/// Largest data message body the client will buffer from a server.
pub const MAX_RESPONSE_BODY_SIZE: usize = 128 * 1024 * 1024;

pub mod info1 {
    pub const READ: u8 = 1 << 0;
    pub const GET_ALL: u8 = 1 << 1;
    pub const GET_ALL_NODATA: u8 = 1 << 2;
    pub const VERIFY: u8 = 1 << 3;
    pub const XDR: u8 = 1 << 4;
    pub const NOBINDATA: u8 = 1 << 5;
}

pub mod info2 {
    pub const WRITE: u8 = 1 << 0;
    pub const DELETE: u8 = 1 << 1;
    pub const GENERATION: u8 = 1 << 2;
    pub const GENERATION_GT: u8 = 1 << 3;
    pub const GENERATION_DUP: u8 = 1 << 4;
    pub const CREATE_ONLY: u8 = 1 << 5;
    pub const BIN_CREATE_ONLY: u8 = 1 << 6;
    pub const WRITE_MERGE: u8 = 1 << 7;
}

pub mod info3 {
    pub const LAST: u8 = 1 << 0;
    pub const COMMIT_LEVEL_B0: u8 = 1 << 1;
    pub const COMMIT_LEVEL_B1: u8 = 1 << 2;
    pub const UPDATE_ONLY: u8 = 1 << 3;
    pub const CREATE_OR_REPLACE: u8 = 1 << 4;
    pub const REPLACE_ONLY: u8 = 1 << 5;
    pub const BIN_REPLACE_ONLY: u8 = 1 << 6;
}

/// Field type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Namespace = 0,
    Set = 1,
    Key = 2,
    Digest = 4,
    TransactionId = 7,
    ScanOptions = 8,
    UdfFilename = 30,
    UdfFunction = 31,
    UdfArgList = 32,
    UdfOp = 33,
}

impl FieldType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FieldType::Namespace,
            1 => FieldType::Set,
            2 => FieldType::Key,
            4 => FieldType::Digest,
            7 => FieldType::TransactionId,
            8 => FieldType::ScanOptions,
            30 => FieldType::UdfFilename,
            31 => FieldType::UdfFunction,
            32 => FieldType::UdfArgList,
            33 => FieldType::UdfOp,
            _ => return None,
        })
    }
}

/// Bin operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operator {
    Read = 1,
    Write = 2,
    Incr = 5,
    Append = 9,
    Prepend = 10,
    Touch = 11,
    McIncr = 129,
    McAppend = 130,
    McPrepend = 131,
    McTouch = 132,
}

impl Operator {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => Operator::Read,
            2 => Operator::Write,
            5 => Operator::Incr,
            9 => Operator::Append,
            10 => Operator::Prepend,
            11 => Operator::Touch,
            129 => Operator::McIncr,
            130 => Operator::McAppend,
            131 => Operator::McPrepend,
            132 => Operator::McTouch,
            _ => return None,
        })
    }
}

/// The 8-byte preamble in front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub version: u8,
    pub msg_type: u8,
    pub size: u64,
}

impl Preamble {
    pub fn new(msg_type: u8, size: u64) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type,
            size,
        }
    }

    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let size = self.size.to_be_bytes();
        let mut out = [0u8; PREAMBLE_SIZE];
        out[0] = self.version;
        out[1] = self.msg_type;
        out[2..].copy_from_slice(&size[2..]);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let bytes = take(buf, 0, PREAMBLE_SIZE, "preamble")?;
        let mut size = [0u8; 8];
        size[2..].copy_from_slice(&bytes[2..]);
        Ok(Self {
            version: bytes[0],
            msg_type: bytes[1],
            size: u64::from_be_bytes(size),
        })
    }

    /// The body length as a buffer size, refusing anything above `limit`.
    pub fn body_len(&self, limit: usize) -> Result<usize> {
        usize::try_from(self.size)
            .ok()
            .filter(|&size| size <= limit)
            .ok_or_else(|| Error::Protocol(format!("message of {} bytes exceeds {limit}", self.size)))
    }
}

/// The fixed header of a data message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub header_size: u8,
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MessageHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.header_size);
        out.push(self.info1);
        out.push(self.info2);
        out.push(self.info3);
        out.push(0);
        out.push(self.result_code);
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&self.record_ttl.to_be_bytes());
        out.extend_from_slice(&self.transaction_ttl.to_be_bytes());
        out.extend_from_slice(&self.n_fields.to_be_bytes());
        out.extend_from_slice(&self.n_ops.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let b = take(buf, 0, MESSAGE_HEADER_SIZE, "message header")?;
        Ok(Self {
            header_size: b[0],
            info1: b[1],
            info2: b[2],
            info3: b[3],
            result_code: b[5],
            generation: read_u32(b, 6)?,
            record_ttl: read_u32(b, 10)?,
            transaction_ttl: read_u32(b, 14)?,
            n_fields: read_u16(b, 18)?,
            n_ops: read_u16(b, 20)?,
        })
    }

    pub fn is_last(&self) -> bool {
        self.info3 & info3::LAST != 0
    }
}

/// Returns `buf[offset..offset + len]` or a protocol error naming `what`.
pub(crate) fn take<'a>(buf: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "truncated {what}: need {len} bytes at offset {offset}, have {}",
                buf.len()
            ))
        })
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let b = take(buf, offset, 2, "u16")?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let b = take(buf, offset, 4, "u32")?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let b = take(buf, offset, 8, "u64")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_be_bytes(raw))
}
