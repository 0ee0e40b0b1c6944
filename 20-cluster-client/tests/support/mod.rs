//! In-process stand-in for a cluster server.
//!
//! Each [`MockNode`] listens on an ephemeral loopback port and answers the
//! info commands the tender sends plus single-record and scan messages.
//! Everything it reports is adjustable while it runs, so tests can move
//! partitions between nodes or make a node misbehave.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use cluster_client::protocol::info::encode_bitmap;
use cluster_client::protocol::wire::{
    FieldType, MESSAGE_HEADER_SIZE, MessageHeader, PREAMBLE_SIZE, PROTO_TYPE_INFO, PROTO_TYPE_MESSAGE,
    Preamble, info1, info3,
};
use cluster_client::protocol::{Bin, Operation, Operator, Value, parse_body};

pub const NAMESPACE: &str = "test";
pub const N_PARTITIONS: u32 = 16;

struct MockState {
    name: Mutex<String>,
    masters: Mutex<Vec<u32>>,
    proles: Mutex<Vec<u32>>,
    /// A second namespace this node only holds replicas of.
    replica_only: Mutex<Option<(String, Vec<u32>)>>,
    generation: AtomicU32,
    services: Mutex<Vec<String>>,
    result_code: AtomicU8,
    /// Data requests still to be read and then left unanswered.
    swallow: AtomicUsize,
    stall: Mutex<Duration>,
    scan_records: AtomicUsize,
    data_connections: AtomicUsize,
    requests: AtomicUsize,
    info_requests: AtomicUsize,
    silent: AtomicBool,
}

pub struct MockNode {
    addr: SocketAddr,
    state: Arc<MockState>,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl MockNode {
    pub fn start(name: &str, masters: Vec<u32>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            name: Mutex::new(name.to_owned()),
            masters: Mutex::new(masters),
            proles: Mutex::new(Vec::new()),
            replica_only: Mutex::new(None),
            generation: AtomicU32::new(1),
            services: Mutex::new(Vec::new()),
            result_code: AtomicU8::new(0),
            swallow: AtomicUsize::new(0),
            stall: Mutex::new(Duration::ZERO),
            scan_records: AtomicUsize::new(0),
            data_connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            info_requests: AtomicUsize::new(0),
            silent: AtomicBool::new(false),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("mock-{name}"))
                .spawn(move || accept_loop(listener, state, stop))?
        };

        Ok(Self {
            addr,
            state,
            stop,
            acceptor: Some(acceptor),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn name(&self) -> String {
        self.state.name.lock().unwrap().clone()
    }

    pub fn rename(&self, name: &str) {
        *self.state.name.lock().unwrap() = name.to_owned();
    }

    /// Replaces the ownership report and bumps the partition generation.
    pub fn set_partitions(&self, masters: Vec<u32>, proles: Vec<u32>) {
        *self.state.masters.lock().unwrap() = masters;
        *self.state.proles.lock().unwrap() = proles;
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Reports replicas of `partitions` in `namespace`, which this node
    /// masters nothing of, and bumps the partition generation.
    pub fn set_replica_only(&self, namespace: &str, partitions: Vec<u32>) {
        *self.state.replica_only.lock().unwrap() = Some((namespace.to_owned(), partitions));
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn announce(&self, peers: &[SocketAddr]) {
        *self.state.services.lock().unwrap() = peers
            .iter()
            .map(|addr| format!("{}:{}", addr.ip(), addr.port()))
            .collect();
    }

    /// Announces raw `host:port` entries, resolvable or not.
    pub fn announce_raw(&self, entries: &[&str]) {
        *self.state.services.lock().unwrap() = entries.iter().map(|entry| (*entry).to_owned()).collect();
    }

    pub fn set_result_code(&self, code: u8) {
        self.state.result_code.store(code, Ordering::SeqCst);
    }

    /// The next `count` data requests are read, held for `stall` and then
    /// dropped with the connection, as if the reply had been lost.
    pub fn swallow_next(&self, count: usize, stall: Duration) {
        *self.state.stall.lock().unwrap() = stall;
        self.state.swallow.store(count, Ordering::SeqCst);
    }

    pub fn set_scan_records(&self, count: usize) {
        self.state.scan_records.store(count, Ordering::SeqCst);
    }

    /// Stops answering info requests; data requests are unaffected.
    pub fn go_silent(&self) {
        self.state.silent.store(true, Ordering::SeqCst);
    }

    pub fn data_connections(&self) -> usize {
        self.state.data_connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn info_requests(&self) -> usize {
        self.state.info_requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            bail!("condition not met within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn accept_loop(listener: TcpListener, state: Arc<MockState>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let _ = serve(stream, &state, &stop);
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(2)),
            Err(_) => break,
        }
    }
}

fn serve(mut stream: TcpStream, state: &MockState, stop: &AtomicBool) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    let mut counted = false;
    loop {
        let mut head = [0u8; PREAMBLE_SIZE];
        match read_or_idle(&mut stream, &mut head, stop)? {
            true => {}
            false => return Ok(()),
        }
        let preamble = Preamble::decode(&head).map_err(|err| std::io::Error::other(err.to_string()))?;
        let mut body = vec![0u8; preamble.size as usize];
        stream.set_read_timeout(None)?;
        stream.read_exact(&mut body)?;
        stream.set_read_timeout(Some(Duration::from_millis(50)))?;

        match preamble.msg_type {
            PROTO_TYPE_INFO => {
                state.info_requests.fetch_add(1, Ordering::SeqCst);
                if state.silent.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let reply = info_reply(state, &String::from_utf8_lossy(&body));
                stream.write_all(&Preamble::new(PROTO_TYPE_INFO, reply.len() as u64).encode())?;
                stream.write_all(reply.as_bytes())?;
            }
            PROTO_TYPE_MESSAGE => {
                if !counted {
                    counted = true;
                    state.data_connections.fetch_add(1, Ordering::SeqCst);
                }
                state.requests.fetch_add(1, Ordering::SeqCst);
                let swallowed = state
                    .swallow
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if swallowed {
                    let stall = *state.stall.lock().unwrap();
                    thread::sleep(stall);
                    return Ok(());
                }
                stream.write_all(&data_reply(state, &body))?;
            }
            _ => return Ok(()),
        }
    }
}

/// Fills `buf`, waiting through idle periods. Returns false on a clean
/// close or when the mock is stopping.
fn read_or_idle(stream: &mut TcpStream, buf: &mut [u8], stop: &AtomicBool) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if stop.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

fn info_reply(state: &MockState, request: &str) -> String {
    let mut reply = String::new();
    for name in request.split('\n').filter(|name| !name.is_empty()) {
        let value = match name {
            "node" => state.name.lock().unwrap().clone(),
            "partitions" => N_PARTITIONS.to_string(),
            "partition-generation" => state.generation.load(Ordering::SeqCst).to_string(),
            "services" => state.services.lock().unwrap().join(";"),
            "replicas-master" => format!(
                "{NAMESPACE}:{}",
                encode_bitmap(&state.masters.lock().unwrap(), N_PARTITIONS)
            ),
            "replicas-prole" => {
                let mut value = format!(
                    "{NAMESPACE}:{}",
                    encode_bitmap(&state.proles.lock().unwrap(), N_PARTITIONS)
                );
                if let Some((namespace, partitions)) = &*state.replica_only.lock().unwrap() {
                    value.push_str(&format!(";{namespace}:{}", encode_bitmap(partitions, N_PARTITIONS)));
                }
                value
            }
            "build" => "mock-1.0".to_owned(),
            _ => String::new(),
        };
        reply.push_str(name);
        reply.push('\t');
        reply.push_str(&value);
        reply.push('\n');
    }
    reply
}

/// Answers a data message: scans get a record stream, everything else one
/// message echoing the written bins back with generation 7.
fn data_reply(state: &MockState, body: &[u8]) -> Vec<u8> {
    let code = state.result_code.load(Ordering::SeqCst);
    let request = match parse_body(body) {
        Ok(request) => request,
        Err(_) => return framed(message(4, 0, 0, &[])),
    };
    let is_scan = request
        .fields
        .iter()
        .any(|field| field.field_type == FieldType::ScanOptions as u8);
    if !is_scan {
        let echoed: Vec<Operation> = request
            .ops
            .into_iter()
            .map(|mut op| {
                if op.bin.value == Value::Null {
                    op.bin.value = Value::Str(format!("value-of-{}", op.bin.name));
                }
                op
            })
            .collect();
        return framed(message(code, 0, 7, &echoed));
    }

    let no_bins = request.info1 & info1::NOBINDATA != 0;
    let count = state.scan_records.load(Ordering::SeqCst);
    let mut out = Vec::new();
    // Two frames: all but the last record, then the rest plus the terminator.
    let split = count.saturating_sub(1);
    let record = |i: usize| {
        let ops = if no_bins {
            Vec::new()
        } else {
            vec![Operation::new(Operator::Read, Bin::new("n", i as i64))]
        };
        message(0, 0, 1, &ops)
    };
    let first: Vec<u8> = (0..split).flat_map(&record).collect();
    let mut second: Vec<u8> = (split..count).flat_map(&record).collect();
    second.extend(message(code, info3::LAST, 0, &[]));
    for frame in [first, second] {
        if frame.is_empty() {
            continue;
        }
        out.extend_from_slice(&Preamble::new(PROTO_TYPE_MESSAGE, frame.len() as u64).encode());
        out.extend_from_slice(&frame);
    }
    out
}

/// One unframed message: header plus ops, no fields.
fn message(code: u8, info3_flags: u8, generation: u32, ops: &[Operation]) -> Vec<u8> {
    let mut out = Vec::new();
    MessageHeader {
        header_size: MESSAGE_HEADER_SIZE as u8,
        info1: 0,
        info2: 0,
        info3: info3_flags,
        result_code: code,
        generation,
        record_ttl: 0,
        transaction_ttl: 0,
        n_fields: 0,
        n_ops: ops.len() as u16,
    }
    .write_to(&mut out);
    for op in ops {
        let mut value = Vec::new();
        op.bin.value.write_to(&mut value).unwrap();
        let name = op.bin.name.as_bytes();
        out.extend_from_slice(&((4 + name.len() + value.len()) as u32).to_be_bytes());
        out.push(op.op as u8);
        out.push(op.bin.value.particle_type());
        out.push(0);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&value);
    }
    out
}

/// Wraps a single message in a preamble.
pub fn framed(single: Vec<u8>) -> Vec<u8> {
    let mut out = Preamble::new(PROTO_TYPE_MESSAGE, single.len() as u64).encode().to_vec();
    out.extend(single);
    out
}
