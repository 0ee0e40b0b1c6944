//! One cluster member.
//!
//! A node is shared as `Arc<Node>`: the cluster keeps one strong reference
//! while the node is live, and every in-flight transaction holds a clone
//! for its duration. Retiring a node drops the cluster's reference and
//! drains the pool; a transaction still holding a clone finishes on its
//! own socket and the node is freed when that clone goes away.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::protocol::info::{self, InfoResponse};

/// Partition generation value that forces a replicas refresh on next tend.
pub const GENERATION_UNKNOWN: u32 = u32::MAX;

pub struct Node {
    name: String,
    addrs: Mutex<Vec<SocketAddr>>,
    pool: ConnectionPool,
    info_conn: Mutex<Option<TcpStream>>,
    partition_generation: AtomicU32,
    retired: AtomicBool,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr, max_conns: usize, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            addrs: Mutex::new(vec![addr]),
            pool: ConnectionPool::new(max_conns, connect_timeout),
            info_conn: Mutex::new(None),
            partition_generation: AtomicU32::new(GENERATION_UNKNOWN),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        lock(&self.addrs).clone()
    }

    pub fn has_addr(&self, addr: &SocketAddr) -> bool {
        lock(&self.addrs).contains(addr)
    }

    /// Records another address for this node. Returns false if already known.
    pub fn add_addr(&self, addr: SocketAddr) -> bool {
        let mut addrs = lock(&self.addrs);
        if addrs.contains(&addr) {
            return false;
        }
        debug!(node = %self.name, addr = %addr, "added alternate address");
        addrs.push(addr);
        true
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Takes a connection from the pool or opens a new one.
    pub fn acquire(&self, nonblocking: bool) -> Result<TcpStream> {
        if self.is_retired() {
            return Err(Error::Connection(format!("node {} has been retired", self.name)));
        }
        let addrs = self.addrs();
        self.pool.acquire(&addrs, nonblocking)
    }

    /// Returns a healthy connection to the pool. Connections of a retired
    /// node are closed instead.
    pub fn release(&self, stream: TcpStream, nonblocking: bool) {
        if self.is_retired() {
            return;
        }
        self.pool.release(stream, nonblocking);
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub fn set_partition_generation(&self, generation: u32) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    /// Makes the next tend re-read this node's partition ownership.
    pub fn force_partition_refresh(&self) {
        self.set_partition_generation(GENERATION_UNKNOWN);
    }

    /// Runs an info request over this node's dedicated info socket,
    /// reconnecting when it is missing or broken.
    pub fn info(&self, names: &[&str], timeout: Duration) -> Result<InfoResponse> {
        let mut slot = lock(&self.info_conn);
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect_info(timeout)?,
        };
        let response = info::exchange(&mut stream, names, timeout)?;
        *slot = Some(stream);
        Ok(response)
    }

    fn connect_info(&self, timeout: Duration) -> Result<TcpStream> {
        let mut last = None;
        for addr in self.addrs() {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(err) => last = Some(Error::from_io(err, &format!("info connect to {addr}"))),
            }
        }
        Err(last.unwrap_or_else(|| Error::Connection(format!("node {} has no addresses", self.name))))
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Marks the node gone and closes its idle sockets.
    pub fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.pool.drain();
        lock(&self.info_conn).take();
        debug!(node = %self.name, closed, "node retired");
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addrs", &self.addrs())
            .field("partition_generation", &self.partition_generation())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
