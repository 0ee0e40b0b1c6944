//! Info sub-protocol: text commands framed by the same 8-byte preamble.
//!
//! A request body is a list of command names, each terminated by `\n`.
//! The response body holds one `name\tvalue\n` line per command. Values
//! this crate interprets:
//!
//! - `node`: the node name
//! - `partitions`: partition count
//! - `partition-generation`: bumped whenever the node's ownership changes
//! - `services`: `host:port;host:port` of peers
//! - `replicas-master` / `replicas-prole`: `ns:bitmap;ns:bitmap`, bitmaps
//!   base-64 encoded, one bit per partition, most significant bit first

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::protocol::wire::{PREAMBLE_SIZE, PROTO_TYPE_INFO, PROTO_VERSION, Preamble};

/// Identity probe.
pub const NODE: &str = "node";
/// Partition count probe, issued once per cluster.
pub const PARTITIONS: &str = "partitions";
/// Per-tend health probe.
pub const CHECK: &[&str] = &["node", "partition-generation", "services"];
/// Partition ownership probe, issued when the generation moves.
pub const REPLICAS: &[&str] = &["partition-generation", "replicas-master", "replicas-prole"];

/// Largest info response accepted.
pub const MAX_RESPONSE_SIZE: usize = 512 * 1024;

/// Longest namespace name a replicas map may carry.
const MAX_NAMESPACE_LEN: usize = 31;

const BITMAP_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Frames an info request for `names`.
pub fn encode_request(names: &[&str]) -> Vec<u8> {
    let body_len: usize = names.iter().map(|name| name.len() + 1).sum();
    let mut buf = Vec::with_capacity(PREAMBLE_SIZE + body_len);
    buf.extend_from_slice(&Preamble::new(PROTO_TYPE_INFO, body_len as u64).encode());
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'\n');
    }
    buf
}

/// Sends one info request over `stream` and reads the reply body.
pub fn exchange(stream: &mut TcpStream, names: &[&str], timeout: Duration) -> Result<InfoResponse> {
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|err| Error::from_io(err, "set info timeout"))?;
    stream
        .write_all(&encode_request(names))
        .map_err(|err| Error::from_io(err, "write info request"))?;

    let mut head = [0u8; PREAMBLE_SIZE];
    stream
        .read_exact(&mut head)
        .map_err(|err| Error::from_io(err, "read info preamble"))?;
    let preamble = Preamble::decode(&head)?;
    if preamble.version != PROTO_VERSION || preamble.msg_type != PROTO_TYPE_INFO {
        return Err(Error::Protocol(format!(
            "unexpected info preamble version {} type {}",
            preamble.version, preamble.msg_type
        )));
    }
    let size = preamble.size as usize;
    if preamble.size > MAX_RESPONSE_SIZE as u64 {
        return Err(Error::Protocol(format!(
            "info response of {} bytes exceeds {MAX_RESPONSE_SIZE}",
            preamble.size
        )));
    }
    let mut body = vec![0u8; size];
    stream
        .read_exact(&mut body)
        .map_err(|err| Error::from_io(err, "read info body"))?;
    let text = String::from_utf8_lossy(&body);
    trace!(bytes = size, "info response received");
    Ok(InfoResponse::parse(&text))
}

/// Connects to `addr`, runs one info request and closes the socket.
pub fn request(addr: SocketAddr, names: &[&str], timeout: Duration) -> Result<InfoResponse> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|err| Error::from_io(err, &format!("connect to {addr}")))?;
    let _ = stream.set_nodelay(true);
    exchange(&mut stream, names, timeout)
}

/// Parsed `name\tvalue` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoResponse {
    values: BTreeMap<String, String>,
}

impl InfoResponse {
    pub fn parse(body: &str) -> Self {
        let values = body
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once('\t') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (line.to_owned(), String::new()),
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value of `name` when the server returned a non-empty one.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }

    pub fn parse_u32(&self, name: &str) -> Option<u32> {
        self.non_empty(name)?.trim().parse().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One namespace's ownership bitmap from a replicas map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceBitmap {
    pub namespace: String,
    pub bitmap: Vec<u8>,
}

impl NamespaceBitmap {
    pub fn owns(&self, partition_id: u32) -> bool {
        bitmap_has(&self.bitmap, partition_id)
    }
}

/// Whether bit `i` is set, most significant bit first within each byte.
pub fn bitmap_has(bitmap: &[u8], i: u32) -> bool {
    bitmap
        .get((i >> 3) as usize)
        .is_some_and(|byte| byte & (0x80 >> (i & 7)) != 0)
}

/// Decodes `ns:b64;ns:b64`. Entries with an invalid namespace or a bitmap
/// whose encoded length does not match `n_partitions` are skipped.
pub fn parse_replicas(value: &str, n_partitions: u32) -> Vec<NamespaceBitmap> {
    let bitmap_size = (n_partitions as usize).div_ceil(8);
    let expected_len = bitmap_size.div_ceil(3) * 4;

    let mut maps: Vec<NamespaceBitmap> = Vec::new();
    for entry in value.split(';').filter(|entry| !entry.is_empty()) {
        let Some((namespace, encoded)) = entry.split_once(':') else {
            warn!(entry = %entry, "replicas entry has no encoded bitmap");
            break;
        };
        let namespace = namespace.trim();
        if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
            warn!(namespace = %namespace, "invalid partition namespace");
            continue;
        }
        if encoded.len() != expected_len {
            warn!(namespace = %namespace, len = encoded.len(), expected = expected_len, "invalid partition bitmap");
            continue;
        }
        let bitmap = match BITMAP_ENGINE.decode(encoded) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                warn!(namespace = %namespace, error = %err, "undecodable partition bitmap");
                continue;
            }
        };
        match maps.iter_mut().find(|map| map.namespace == namespace) {
            Some(existing) => {
                for (dst, src) in existing.bitmap.iter_mut().zip(&bitmap) {
                    *dst |= src;
                }
            }
            None => maps.push(NamespaceBitmap {
                namespace: namespace.to_owned(),
                bitmap,
            }),
        }
    }
    maps
}

/// Splits a `services` value into `(host, port)` pairs, dropping bad entries.
pub fn parse_services(value: &str) -> Vec<(String, u16)> {
    value
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (host, port) = entry.rsplit_once(':')?;
            match port.trim().parse() {
                Ok(port) => Some((host.trim().to_owned(), port)),
                Err(_) => {
                    warn!(entry = %entry, "ignoring malformed service entry");
                    None
                }
            }
        })
        .collect()
}

/// Encodes a bitmap the way servers do, for tests and mock servers.
pub fn encode_bitmap(owned: &[u32], n_partitions: u32) -> String {
    let mut bitmap = vec![0u8; (n_partitions as usize).div_ceil(8)];
    for &pid in owned.iter().filter(|&&pid| pid < n_partitions) {
        bitmap[(pid >> 3) as usize] |= 0x80 >> (pid & 7);
    }
    base64::engine::general_purpose::STANDARD.encode(bitmap)
}
