//! Transaction executor.
//!
//! # Attempt lifecycle
//!
//! ```text
//! Compiling -> Connecting -> Sending -> AwaitingHeader -> AwaitingBody -> Parsed
//!                  ^                                                  |
//!                  +---------------- retry (transport error) ---------+
//! ```
//!
//! The request is compiled once. Each attempt picks a node, takes a pooled
//! connection, writes the message and reads the fixed 30-byte header
//! followed by the body. Every socket step is bounded by the progress
//! timeout, clipped to whatever is left of the deadline.
//!
//! A connection that saw any error is dropped rather than pooled: a
//! half-read response would desynchronize the next transaction on it.
//! Only transport failures are retried; server answers, encoding and
//! protocol errors go straight back to the caller.
//!
//! Multi-message responses (scans) are read by [`execute_stream`], which
//! feeds records into a bounded channel as each framed message arrives.

use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, trace, warn};

use crate::cluster::Cluster;
use crate::config::{Policy, RetryPolicy};
use crate::error::{Error, Result, ResultCode};
use crate::node::Node;
use crate::protocol::codec::{self, Field, Operation, Request, Response};
use crate::protocol::value::Value;
use crate::protocol::wire::{
    FULL_HEADER_SIZE, MAX_RESPONSE_BODY_SIZE, PREAMBLE_SIZE, PROTO_TYPE_MESSAGE, PROTO_VERSION, Preamble,
};
use crate::task_pool::TaskPool;

/// Seconds between the Unix epoch and the server's epoch (2010-01-01).
pub const SERVER_EPOCH_OFFSET: u64 = 1_262_304_000;

const NODE_RETRY_PAUSE: Duration = Duration::from_millis(10);
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(1);
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// Outcome of a single-record transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// Always `Ok`; a retried delete that found nothing is folded into it.
    pub result_code: ResultCode,
    pub generation: u32,
    /// Seconds until the record expires; zero when it never does or
    /// already has.
    pub ttl: u32,
    pub fields: Vec<Field>,
    pub ops: Vec<Operation>,
}

impl TransactionResult {
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.ops
            .iter()
            .find(|op| op.bin.name == name)
            .map(|op| &op.bin.value)
    }

    fn from_response(response: Response, now_secs: u64) -> Self {
        Self {
            result_code: response.result_code,
            generation: response.generation,
            ttl: ttl_from_void_time(response.record_ttl, now_secs),
            fields: response.fields,
            ops: response.ops,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Sending,
    AwaitingHeader,
    AwaitingBody,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connecting => "connect",
            Phase::Sending => "send",
            Phase::AwaitingHeader => "header read",
            Phase::AwaitingBody => "body read",
        })
    }
}

/// Runs one single-record transaction against the node that owns its key.
///
/// Returns `Err(Error::Server)` for any non-OK answer, with one exception:
/// a delete that had to be retried and then reports `NotFound` succeeds,
/// on the assumption that the lost first attempt removed the record.
///
/// Once a deadline has passed the result is `Err(Error::Timeout)`, whatever
/// the last failure was.
pub fn execute_transaction(cluster: &Cluster, request: &Request, policy: &Policy) -> Result<TransactionResult> {
    let start = Instant::now();
    let digest = request.routing_digest()?;
    let message = codec::compile(request)?;
    let deadline = policy.deadline_from(start);
    let progress = policy.progress_timeout();
    let for_write = request.is_write();

    let mut attempts = 0u32;
    loop {
        if cluster.is_shut_down() {
            return Err(Error::Shutdown);
        }

        let node = match cluster.node_for(&request.namespace, &digest, for_write) {
            Ok(node) => node,
            Err(err) => {
                match deadline {
                    None => return Err(err),
                    Some(deadline) if Instant::now() >= deadline => {
                        return Err(Error::Timeout(format!("deadline passed selecting a node: {err}")));
                    }
                    Some(_) => {}
                }
                thread::sleep(NODE_RETRY_PAUSE);
                continue;
            }
        };

        let mut stream = match node.acquire(false) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(node = %node, phase = %Phase::Connecting, error = %err, "attempt failed");
                if policy.retry == RetryPolicy::NoRetry {
                    return Err(err);
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(Error::Timeout(format!("deadline passed connecting to {node}")));
                }
                thread::sleep(CONNECT_RETRY_PAUSE);
                continue;
            }
        };

        attempts += 1;
        match round_trip(&mut stream, &message, progress, deadline) {
            Ok(body) => {
                node.release(stream, false);
                let response = codec::parse_body(&body)?;
                trace!(node = %node, attempts, code = %response.result_code, "transaction answered");
                return finish(request, response, attempts);
            }
            Err((phase, err)) => {
                drop(stream);
                debug!(node = %node, attempts, phase = %phase, error = %err, "attempt failed");
                if !err.is_retryable() || policy.retry == RetryPolicy::NoRetry {
                    return Err(err);
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(Error::Timeout(format!(
                        "deadline passed after {attempts} attempts, last failed during {phase}: {err}"
                    )));
                }
            }
        }
    }
}

fn finish(request: &Request, mut response: Response, attempts: u32) -> Result<TransactionResult> {
    let code = response.result_code;
    let retried_delete = attempts > 1 && request.is_delete() && code == ResultCode::NotFound;
    if retried_delete {
        debug!(attempts, "retried delete found nothing, counting it as done");
        response.result_code = ResultCode::Ok;
    } else if !code.is_ok() {
        return Err(Error::Server { code });
    }
    Ok(TransactionResult::from_response(response, now_secs()))
}

/// Writes `message` and reads one framed response, returning the bytes
/// after the preamble.
fn round_trip(
    stream: &mut TcpStream,
    message: &[u8],
    progress: Duration,
    deadline: Option<Instant>,
) -> std::result::Result<Vec<u8>, (Phase, Error)> {
    let step = |phase: Phase| move |err: Error| (phase, err);

    stream
        .set_write_timeout(Some(io_timeout(progress, deadline)))
        .and_then(|()| stream.write_all(message))
        .map_err(|err| Error::from_io(err, "write request"))
        .map_err(step(Phase::Sending))?;

    let mut header = [0u8; FULL_HEADER_SIZE];
    stream
        .set_read_timeout(Some(io_timeout(progress, deadline)))
        .and_then(|()| stream.read_exact(&mut header))
        .map_err(|err| Error::from_io(err, "read response header"))
        .map_err(step(Phase::AwaitingHeader))?;
    let (message_size, header_size) = codec::parse_header(&header).map_err(step(Phase::AwaitingHeader))?;

    let mut body = vec![0u8; message_size];
    body[..header_size].copy_from_slice(&header[PREAMBLE_SIZE..]);
    stream
        .set_read_timeout(Some(io_timeout(progress, deadline)))
        .and_then(|()| stream.read_exact(&mut body[header_size..]))
        .map_err(|err| Error::from_io(err, "read response body"))
        .map_err(step(Phase::AwaitingBody))?;
    Ok(body)
}

/// The progress timeout, clipped to the time left before `deadline`.
fn io_timeout(progress: Duration, deadline: Option<Instant>) -> Duration {
    let left = deadline.map_or(progress, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    });
    progress.min(left).max(MIN_IO_TIMEOUT)
}

/// Converts a server void-time into seconds left to live.
pub fn ttl_from_void_time(void_time: u32, now_unix_secs: u64) -> u32 {
    let now = now_unix_secs.saturating_sub(SERVER_EPOCH_OFFSET);
    u64::from(void_time)
        .checked_sub(now)
        .and_then(|left| u32::try_from(left).ok())
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Runs a multi-message request on `node`, sending every record to `sink`.
///
/// Returns the number of records delivered. Reads block for at most
/// `policy.timeout` each, or indefinitely when it is `None`. A receiver
/// that hangs up ends the stream early; the connection is then dropped
/// because the rest of the response is still on the wire.
pub fn execute_stream(node: &Arc<Node>, request: &Request, policy: &Policy, sink: &Sender<Response>) -> Result<usize> {
    let message = codec::compile(request)?;
    let read_timeout = policy.timeout.filter(|timeout| !timeout.is_zero());
    let mut stream = node.acquire(false)?;

    stream
        .set_write_timeout(Some(policy.progress_timeout()))
        .and_then(|()| stream.write_all(&message))
        .map_err(|err| Error::from_io(err, "write stream request"))?;
    stream
        .set_read_timeout(read_timeout)
        .map_err(|err| Error::from_io(err, "configure stream socket"))?;

    let no_bin_data = request.no_bin_data();
    let mut delivered = 0usize;
    loop {
        let body = read_frame(&mut stream)?;
        let batch = codec::parse_records(&body, no_bin_data)?;
        for record in batch.records {
            if sink.send(record).is_err() {
                debug!(node = %node, delivered, "stream receiver gone, abandoning response");
                return Ok(delivered);
            }
            delivered += 1;
        }
        if batch.done {
            node.release(stream, false);
            if !batch.result_code.is_ok() {
                return Err(Error::Server {
                    code: batch.result_code,
                });
            }
            trace!(node = %node, delivered, "stream complete");
            return Ok(delivered);
        }
    }
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = [0u8; PREAMBLE_SIZE];
    stream
        .read_exact(&mut head)
        .map_err(|err| Error::from_io(err, "read stream preamble"))?;
    let preamble = Preamble::decode(&head)?;
    if preamble.version != PROTO_VERSION || preamble.msg_type != PROTO_TYPE_MESSAGE {
        return Err(Error::Protocol(format!(
            "unexpected frame version {} type {}",
            preamble.version, preamble.msg_type
        )));
    }
    let mut body = vec![0u8; preamble.body_len(MAX_RESPONSE_BODY_SIZE)?];
    stream
        .read_exact(&mut body)
        .map_err(|err| Error::from_io(err, "read stream body"))?;
    Ok(body)
}

/// Runs [`execute_stream`] on its own thread and hands back the receiving
/// end of a channel holding at most `capacity` undelivered records.
pub fn spawn_stream(
    node: Arc<Node>,
    request: Request,
    policy: Policy,
    capacity: usize,
) -> Result<(Receiver<Response>, JoinHandle<Result<usize>>)> {
    let (tx, rx) = bounded(capacity);
    let handle = thread::Builder::new()
        .name(format!("stream-{}", node.name()))
        .spawn(move || execute_stream(&node, &request, &policy, &tx))
        .map_err(|err| Error::from_io(err, "spawn stream thread"))?;
    Ok((rx, handle))
}

/// Runs `request` against every live node on `pool`, funnelling all records
/// into `sink`. Returns each node's name with its record count or failure.
pub fn scan_nodes(
    cluster: &Cluster,
    request: &Request,
    policy: &Policy,
    pool: &TaskPool,
    sink: &Sender<Response>,
) -> Vec<(String, Result<usize>)> {
    let nodes = cluster.nodes();
    if nodes.is_empty() {
        warn!(namespace = %request.namespace, "scan found no live nodes");
    }
    let request = request.clone();
    let policy = *policy;
    let sink = sink.clone();
    pool.run(nodes, move |node| {
        let outcome = execute_stream(&node, &request, &policy, &sink);
        (node.name().to_owned(), outcome)
    })
}
