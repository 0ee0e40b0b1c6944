//! Request compilation and response parsing.
//!
//! `compile` lays out one data message: preamble, header, then fields in a
//! fixed order (namespace, set, transaction id, scan options, UDF call, key,
//! digest) followed by the bin operations. The message size is computed up
//! front so every buffer is written exactly once.
//!
//! Parsing never trusts a count or size from the wire: each field and op is
//! bounds-checked against the remaining buffer before it is read.

use crate::digest::{DIGEST_SIZE, Digest};
use crate::error::{Error, Result, ResultCode};
use crate::protocol::value::{Bin, Value};
use crate::protocol::wire::{
    self, FIELD_HEADER_SIZE, FULL_HEADER_SIZE, FieldType, MAX_BODY_SIZE, MAX_RESPONSE_BODY_SIZE,
    MESSAGE_HEADER_SIZE, MessageHeader, OP_HEADER_SIZE, Operator, PREAMBLE_SIZE, PROTO_TYPE_MESSAGE,
    PROTO_VERSION, Preamble, info1, info2,
};

/// One bin operation in a request or response.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: Operator,
    pub bin: Bin,
}

impl Operation {
    pub fn new(op: Operator, bin: Bin) -> Self {
        Self { op, bin }
    }

    fn wire_size(&self) -> Result<usize> {
        Ok(OP_HEADER_SIZE + self.bin.name.len() + self.bin.value.wire_size()?)
    }
}

/// A server-side function invocation carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfCall {
    pub filename: String,
    pub function: String,
    /// Serialized argument list, passed through untouched.
    pub args: Vec<u8>,
    /// Invocation kind; zero means "no UDF op field".
    pub op: u8,
}

/// Scan parameters carried in the scan options field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// 0 (auto) to 3; the server schedules by it.
    pub priority: u8,
    pub fail_on_cluster_change: bool,
    /// Share of each partition to sample, 1 to 100.
    pub percent: u8,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            fail_on_cluster_change: false,
            percent: 100,
        }
    }
}

impl ScanOptions {
    pub fn to_bytes(self) -> [u8; 2] {
        let flags = (self.priority << 4) | (u8::from(self.fail_on_cluster_change) << 3);
        [flags, self.percent.min(100)]
    }
}

/// A raw field as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub field_type: u8,
    pub data: Vec<u8>,
}

/// Everything needed to compile one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub namespace: String,
    pub set: Option<String>,
    /// Raw key, sent so the server can verify the digest.
    pub key: Option<Value>,
    pub digest: Option<Digest>,
    pub transaction_id: Option<u64>,
    pub scan_options: Option<Vec<u8>>,
    pub udf: Option<UdfCall>,
    pub ops: Vec<Operation>,
}

impl Request {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_set(mut self, set: impl Into<String>) -> Self {
        self.set = Some(set.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Reads the named bins, or the whole record when `bins` is empty.
    pub fn read(mut self, bins: &[&str]) -> Self {
        self.info1 |= info1::READ;
        if bins.is_empty() {
            self.info1 |= info1::GET_ALL;
        }
        self.ops = bins
            .iter()
            .map(|name| Operation::new(Operator::Read, Bin::named(*name)))
            .collect();
        self
    }

    /// Reads only the record metadata (generation and TTL).
    pub fn exists(mut self) -> Self {
        self.info1 |= info1::READ | info1::NOBINDATA;
        self.ops.clear();
        self
    }

    pub fn write(mut self, bins: Vec<Bin>) -> Self {
        self.info2 |= info2::WRITE;
        self.ops = bins
            .into_iter()
            .map(|bin| Operation::new(Operator::Write, bin))
            .collect();
        self
    }

    pub fn delete(mut self) -> Self {
        self.info2 |= info2::WRITE | info2::DELETE;
        self.ops.clear();
        self
    }

    /// Scans a namespace (and optionally one set) on a single node.
    pub fn scan(mut self, options: ScanOptions, no_bin_data: bool) -> Self {
        self.info1 |= info1::READ;
        if no_bin_data {
            self.info1 |= info1::NOBINDATA;
        }
        self.scan_options = Some(options.to_bytes().to_vec());
        self
    }

    pub fn no_bin_data(&self) -> bool {
        self.info1 & info1::NOBINDATA != 0
    }

    /// Appends arbitrary operations; write flags follow from the operators.
    pub fn operate(mut self, ops: Vec<Operation>) -> Self {
        for op in &ops {
            if op.op == Operator::Read {
                self.info1 |= info1::READ;
            } else {
                self.info2 |= info2::WRITE;
            }
        }
        self.ops.extend(ops);
        self
    }

    pub fn is_write(&self) -> bool {
        self.info2 & info2::WRITE != 0
    }

    pub fn is_delete(&self) -> bool {
        self.info2 & info2::DELETE != 0
    }

    /// The digest used for routing: the explicit one, or one computed from
    /// the set and raw key.
    pub fn routing_digest(&self) -> Result<Digest> {
        if let Some(digest) = self.digest {
            return Ok(digest);
        }
        match &self.key {
            Some(key) => Digest::compute(self.set.as_deref().unwrap_or(""), key),
            None => Err(Error::InvalidArgument(
                "request carries neither a key nor a digest".into(),
            )),
        }
    }

    fn field_count(&self) -> usize {
        let udf_fields = self
            .udf
            .as_ref()
            .map_or(0, |udf| 3 + usize::from(udf.op != 0));
        1 + usize::from(self.set.is_some())
            + usize::from(self.transaction_id.is_some())
            + usize::from(self.scan_options.is_some())
            + udf_fields
            + usize::from(self.key.is_some())
            + usize::from(self.digest.is_some())
    }

    /// Total bytes `compile` produces, preamble included.
    pub fn message_size(&self) -> Result<usize> {
        if self.namespace.is_empty() {
            return Err(Error::InvalidArgument("namespace must not be empty".into()));
        }
        let mut size = FULL_HEADER_SIZE;
        size += FIELD_HEADER_SIZE + self.namespace.len();
        if let Some(set) = &self.set {
            size += FIELD_HEADER_SIZE + set.len();
        }
        if self.transaction_id.is_some() {
            size += FIELD_HEADER_SIZE + 8;
        }
        if let Some(options) = &self.scan_options {
            size += FIELD_HEADER_SIZE + options.len();
        }
        if let Some(udf) = &self.udf {
            size += 3 * FIELD_HEADER_SIZE + udf.filename.len() + udf.function.len() + udf.args.len();
            if udf.op != 0 {
                size += FIELD_HEADER_SIZE + 1;
            }
        }
        if let Some(key) = &self.key {
            size += FIELD_HEADER_SIZE + 1 + key.wire_size()?;
        }
        if self.digest.is_some() {
            size += FIELD_HEADER_SIZE + DIGEST_SIZE;
        }
        for op in &self.ops {
            op.bin.check_name()?;
            size += op.wire_size()?;
        }
        Ok(size)
    }
}

/// A parsed data message.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub result_code: ResultCode,
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub generation: u32,
    /// Record expiry as sent by the server: a void-time, not a TTL.
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub fields: Vec<Field>,
    pub ops: Vec<Operation>,
}

impl Response {
    pub fn is_last(&self) -> bool {
        self.info3 & wire::info3::LAST != 0
    }

    pub fn bins(&self) -> impl Iterator<Item = &Bin> {
        self.ops.iter().map(|op| &op.bin)
    }

    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins().find(|bin| bin.name == name).map(|bin| &bin.value)
    }

    fn field(&self, field_type: FieldType) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|field| field.field_type == field_type as u8)
            .map(|field| field.data.as_slice())
    }

    pub fn namespace(&self) -> Option<String> {
        self.field(FieldType::Namespace)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn set_name(&self) -> Option<String> {
        self.field(FieldType::Set)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn digest(&self) -> Option<Digest> {
        self.field(FieldType::Digest).and_then(Digest::from_slice)
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.field(FieldType::TransactionId)
            .and_then(|data| wire::read_u64(data, 0).ok())
    }
}

/// Messages parsed from one multi-record body.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<Response>,
    /// The stream ended: a message carried `LAST` or a non-OK result.
    pub done: bool,
    /// Final status of the stream; `NotFound` has already been folded to `Ok`.
    pub result_code: ResultCode,
}

/// Compiles `request` into a freshly allocated buffer.
pub fn compile(request: &Request) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    compile_into(request, &mut buf)?;
    Ok(buf)
}

/// Compiles `request` into `buf`, replacing its contents.
///
/// The buffer grows when the message does not fit its current capacity; the
/// bytes written are the same either way.
pub fn compile_into(request: &Request, buf: &mut Vec<u8>) -> Result<()> {
    let total = request.message_size()?;
    let body = (total - PREAMBLE_SIZE) as u64;
    if body > MAX_BODY_SIZE {
        return Err(Error::Encoding(format!("message of {total} bytes is too large")));
    }
    let n_fields = u16::try_from(request.field_count())
        .map_err(|_| Error::Encoding("too many fields".into()))?;
    let n_ops = u16::try_from(request.ops.len())
        .map_err(|_| Error::Encoding(format!("{} ops exceed the op limit", request.ops.len())))?;

    buf.clear();
    buf.reserve(total);
    buf.extend_from_slice(&Preamble::new(PROTO_TYPE_MESSAGE, body).encode());
    MessageHeader {
        header_size: MESSAGE_HEADER_SIZE as u8,
        info1: request.info1,
        info2: request.info2,
        info3: request.info3,
        result_code: 0,
        generation: request.generation,
        record_ttl: request.record_ttl,
        transaction_ttl: request.transaction_ttl,
        n_fields,
        n_ops,
    }
    .write_to(buf);

    write_field(buf, FieldType::Namespace, request.namespace.as_bytes())?;
    if let Some(set) = &request.set {
        write_field(buf, FieldType::Set, set.as_bytes())?;
    }
    if let Some(trid) = request.transaction_id {
        write_field(buf, FieldType::TransactionId, &trid.to_be_bytes())?;
    }
    if let Some(options) = &request.scan_options {
        write_field(buf, FieldType::ScanOptions, options)?;
    }
    if let Some(udf) = &request.udf {
        write_field(buf, FieldType::UdfFilename, udf.filename.as_bytes())?;
        write_field(buf, FieldType::UdfFunction, udf.function.as_bytes())?;
        write_field(buf, FieldType::UdfArgList, &udf.args)?;
        if udf.op != 0 {
            write_field(buf, FieldType::UdfOp, &[udf.op])?;
        }
    }
    if let Some(key) = &request.key {
        let mut data = Vec::with_capacity(1 + key.wire_size()?);
        key.write_key(&mut data)?;
        write_field(buf, FieldType::Key, &data)?;
    }
    if let Some(digest) = &request.digest {
        write_field(buf, FieldType::Digest, digest.as_bytes())?;
    }
    for op in &request.ops {
        write_op(buf, op)?;
    }

    debug_assert_eq!(buf.len(), total);
    Ok(())
}

fn write_field(buf: &mut Vec<u8>, field_type: FieldType, data: &[u8]) -> Result<()> {
    let size = u32::try_from(data.len() + 1)
        .map_err(|_| Error::Encoding(format!("{field_type:?} field too large")))?;
    buf.extend_from_slice(&size.to_be_bytes());
    buf.push(field_type as u8);
    buf.extend_from_slice(data);
    Ok(())
}

fn write_op(buf: &mut Vec<u8>, op: &Operation) -> Result<()> {
    let name = op.bin.name.as_bytes();
    let value_len = op.bin.value.wire_size()?;
    let size = u32::try_from(4 + name.len() + value_len)
        .map_err(|_| Error::Encoding(format!("bin {:?} too large", op.bin.name)))?;
    buf.extend_from_slice(&size.to_be_bytes());
    buf.push(op.op as u8);
    buf.push(op.bin.value.particle_type());
    buf.push(0);
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    op.bin.value.write_to(buf)
}

/// Validates the preamble and header at the start of `bytes`.
///
/// Returns `(message_size, header_size)`: the preamble's size (header plus
/// body) and the header size, so the caller knows to read
/// `message_size - header_size` more bytes.
pub fn parse_header(bytes: &[u8]) -> Result<(usize, usize)> {
    let preamble = Preamble::decode(bytes)?;
    if preamble.version != PROTO_VERSION {
        return Err(Error::Protocol(format!(
            "unexpected protocol version {}",
            preamble.version
        )));
    }
    if preamble.msg_type != PROTO_TYPE_MESSAGE {
        return Err(Error::Protocol(format!(
            "unexpected message type {}",
            preamble.msg_type
        )));
    }
    let header_size = usize::from(wire::take(bytes, PREAMBLE_SIZE, 1, "header size")?[0]);
    if header_size != MESSAGE_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "header size {header_size}, expected {MESSAGE_HEADER_SIZE}"
        )));
    }
    let message_size = preamble.body_len(MAX_RESPONSE_BODY_SIZE)?;
    if message_size < header_size {
        return Err(Error::Protocol(format!(
            "message size {message_size} smaller than its header"
        )));
    }
    Ok((message_size, header_size))
}

/// Parses a single message: header, fields and ops, with nothing after it.
pub fn parse_body(message: &[u8]) -> Result<Response> {
    let (response, used) = parse_message(message)?;
    if used != message.len() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after message",
            message.len() - used
        )));
    }
    Ok(response)
}

/// Parses a body holding several concatenated messages (scan, query, batch).
///
/// Messages before the terminating one are returned as records when they
/// carry ops, or unconditionally when `no_bin_data` reads were requested.
pub fn parse_records(body: &[u8], no_bin_data: bool) -> Result<RecordBatch> {
    let mut batch = RecordBatch {
        records: Vec::new(),
        done: false,
        result_code: ResultCode::Ok,
    };
    let mut offset = 0;
    while offset < body.len() {
        let (response, used) = parse_message(&body[offset..])?;
        offset += used;
        if !response.result_code.is_ok() {
            batch.done = true;
            batch.result_code = match response.result_code {
                ResultCode::NotFound => ResultCode::Ok,
                code => code,
            };
            break;
        }
        if response.is_last() {
            batch.done = true;
            break;
        }
        if !response.ops.is_empty() || no_bin_data {
            batch.records.push(response);
        }
    }
    Ok(batch)
}

/// Parses one message from the front of `buf`, returning it and the bytes used.
fn parse_message(buf: &[u8]) -> Result<(Response, usize)> {
    let header = MessageHeader::decode(buf)?;
    if usize::from(header.header_size) != MESSAGE_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "header size {}, expected {MESSAGE_HEADER_SIZE}",
            header.header_size
        )));
    }
    let mut offset = MESSAGE_HEADER_SIZE;

    let mut fields = Vec::with_capacity(usize::from(header.n_fields).min(16));
    for _ in 0..header.n_fields {
        let size = wire::read_u32(buf, offset)? as usize;
        if size == 0 {
            return Err(Error::Protocol("zero-sized field".into()));
        }
        let field_type = wire::take(buf, offset + 4, 1, "field type")?[0];
        let data = wire::take(buf, offset + FIELD_HEADER_SIZE, size - 1, "field data")?;
        fields.push(Field {
            field_type,
            data: data.to_vec(),
        });
        offset += 4 + size;
    }

    let mut ops = Vec::with_capacity(usize::from(header.n_ops).min(64));
    for _ in 0..header.n_ops {
        let size = wire::read_u32(buf, offset)? as usize;
        let head = wire::take(buf, offset + 4, 4, "op header")?;
        let (code, particle, name_len) = (head[0], head[1], usize::from(head[3]));
        let op = Operator::from_u8(code)
            .ok_or_else(|| Error::Protocol(format!("unknown op code {code}")))?;
        let value_len = size
            .checked_sub(4 + name_len)
            .ok_or_else(|| Error::Protocol(format!("op size {size} shorter than its name")))?;
        let name = wire::take(buf, offset + OP_HEADER_SIZE, name_len, "bin name")?;
        let value = wire::take(buf, offset + OP_HEADER_SIZE + name_len, value_len, "bin value")?;
        ops.push(Operation {
            op,
            bin: Bin {
                name: String::from_utf8_lossy(name).into_owned(),
                value: Value::decode(particle, value)?,
            },
        });
        offset += 4 + size;
    }

    Ok((
        Response {
            result_code: ResultCode::from_u8(header.result_code),
            info1: header.info1,
            info2: header.info2,
            info3: header.info3,
            generation: header.generation,
            record_ttl: header.record_ttl,
            transaction_ttl: header.transaction_ttl,
            fields,
            ops,
        },
        offset,
    ))
}
