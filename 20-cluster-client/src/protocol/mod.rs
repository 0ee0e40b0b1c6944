//! Binary message format and the text info sub-protocol.
//!
//! - [`wire`]: preamble and header layout, flag bits, field and op tags
//! - [`value`]: typed bin values
//! - [`codec`]: `compile` requests and parse responses
//! - [`info`]: info command framing and value parsers

pub mod codec;
pub mod info;
pub mod value;
pub mod wire;

pub use codec::{
    Field, Operation, RecordBatch, Request, Response, ScanOptions, UdfCall, compile, compile_into,
    parse_body, parse_header, parse_records,
};
pub use value::{Bin, ParticleType, Value};
pub use wire::Operator;
