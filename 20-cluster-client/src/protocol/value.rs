//! Typed bin values and their particle-type tags.

use std::fmt;

use crate::error::{Error, Result};

/// Longest bin name the server accepts.
pub const MAX_BIN_NAME_LEN: usize = 14;

/// Wire-level type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParticleType {
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
    Timestamp = 5,
    Digest = 6,
    JavaBlob = 7,
    CsharpBlob = 8,
    PythonBlob = 9,
    RubyBlob = 10,
    PhpBlob = 11,
    ErlangBlob = 12,
    LuaBlob = 14,
    Map = 19,
    List = 20,
}

impl ParticleType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use ParticleType::*;
        Some(match tag {
            0 => Null,
            1 => Integer,
            2 => Float,
            3 => String,
            4 => Blob,
            5 => Timestamp,
            6 => Digest,
            7 => JavaBlob,
            8 => CsharpBlob,
            9 => PythonBlob,
            10 => RubyBlob,
            11 => PhpBlob,
            12 => ErlangBlob,
            14 => LuaBlob,
            19 => Map,
            20 => List,
            _ => return None,
        })
    }
}

/// A bin value as it travels on the wire.
///
/// Lists and maps are carried as already-serialized blobs; this crate never
/// looks inside them. Values with a particle type the client has no
/// dedicated variant for (language blobs, unknown tags) are kept as
/// [`Value::Typed`] so they survive a read-modify-write unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
    List(Vec<u8>),
    Map(Vec<u8>),
    Typed { particle: u8, bytes: Vec<u8> },
}

impl Value {
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Null => ParticleType::Null as u8,
            Value::Int(_) => ParticleType::Integer as u8,
            Value::Float(_) => ParticleType::Float as u8,
            Value::Str(_) => ParticleType::String as u8,
            Value::Blob(_) => ParticleType::Blob as u8,
            Value::List(_) => ParticleType::List as u8,
            Value::Map(_) => ParticleType::Map as u8,
            Value::Typed { particle, .. } => *particle,
        }
    }

    /// Number of bytes [`Value::write_to`] will append.
    pub fn wire_size(&self) -> Result<usize> {
        Ok(match self {
            Value::Null => 0,
            Value::Int(_) => 8,
            Value::Float(_) => return Err(unsupported(self)),
            Value::Str(s) => s.len(),
            Value::Blob(b) | Value::List(b) | Value::Map(b) => b.len(),
            Value::Typed { bytes, .. } => bytes.len(),
        })
    }

    /// Appends the value payload (no type tag, no length).
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Value::Null => {}
            Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            Value::Float(_) => return Err(unsupported(self)),
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Blob(b) | Value::List(b) | Value::Map(b) => out.extend_from_slice(b),
            Value::Typed { bytes, .. } => out.extend_from_slice(bytes),
        }
        Ok(())
    }

    /// Rebuilds a value from its particle type and payload.
    pub fn decode(particle: u8, bytes: &[u8]) -> Result<Self> {
        Ok(match ParticleType::from_u8(particle) {
            Some(ParticleType::Null) => Value::Null,
            Some(ParticleType::Integer) => Value::Int(decode_int(bytes)?),
            Some(ParticleType::Float) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Value::Float(f64::from_bits(u64::from_be_bytes(raw)))
            }
            Some(ParticleType::String) => match String::from_utf8(bytes.to_vec()) {
                Ok(s) => Value::Str(s),
                Err(err) => Value::Typed {
                    particle,
                    bytes: err.into_bytes(),
                },
            },
            Some(ParticleType::Blob) => Value::Blob(bytes.to_vec()),
            Some(ParticleType::List) => Value::List(bytes.to_vec()),
            Some(ParticleType::Map) => Value::Map(bytes.to_vec()),
            _ => Value::Typed {
                particle,
                bytes: bytes.to_vec(),
            },
        })
    }

    /// Appends the key-field form: particle type byte followed by the payload.
    ///
    /// Only strings, integers and blob-like values can identify a record.
    pub fn write_key(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Value::Null | Value::Float(_) => Err(Error::Encoding(format!(
                "particle type {} cannot be used as a key",
                self.particle_type()
            ))),
            _ => {
                out.push(self.particle_type());
                self.write_to(out)
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "blob[{}]", b.len()),
            Value::List(b) => write!(f, "list[{}]", b.len()),
            Value::Map(b) => write!(f, "map[{}]", b.len()),
            Value::Typed { particle, bytes } => write!(f, "type{particle}[{}]", bytes.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

/// A named value within a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A bin with no value, used to name the bins a read should return.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
        }
    }

    pub(crate) fn check_name(&self) -> Result<()> {
        if self.name.len() > MAX_BIN_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "bin name {:?} is longer than {MAX_BIN_NAME_LEN} bytes",
                self.name
            )));
        }
        Ok(())
    }
}

/// Decodes a big-endian integer of 0 to 8 bytes, sign-extending short values.
pub fn decode_int(bytes: &[u8]) -> Result<i64> {
    if bytes.len() > 8 {
        return Err(Error::Protocol(format!(
            "integer value is {} bytes, at most 8 allowed",
            bytes.len()
        )));
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut raw = [fill; 8];
    raw[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(i64::from_be_bytes(raw))
}

fn unsupported(value: &Value) -> Error {
    Error::Encoding(format!(
        "particle type {} is not supported on the wire",
        value.particle_type()
    ))
}
