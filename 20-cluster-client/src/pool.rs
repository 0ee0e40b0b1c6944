//! Per-node connection pool.
//!
//! Blocking ("sync") connections are reused by ordinary transactions and
//! capped; non-blocking ("async") connections serve bulk callers and are
//! never capped. Each queue has its own lock, so acquire/release never
//! waits on topology updates.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};

pub struct ConnectionPool {
    sync: Mutex<VecDeque<TcpStream>>,
    nonblocking: Mutex<VecDeque<TcpStream>>,
    max_sync: usize,
    connect_timeout: Duration,
    opened: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(max_sync: usize, connect_timeout: Duration) -> Self {
        Self {
            sync: Mutex::new(VecDeque::new()),
            nonblocking: Mutex::new(VecDeque::new()),
            max_sync,
            connect_timeout,
            opened: AtomicUsize::new(0),
        }
    }

    fn queue(&self, nonblocking: bool) -> &Mutex<VecDeque<TcpStream>> {
        if nonblocking {
            &self.nonblocking
        } else {
            &self.sync
        }
    }

    /// Pops a live queued connection, or opens one to the first address
    /// in `addrs` that accepts.
    pub fn acquire(&self, addrs: &[SocketAddr], nonblocking: bool) -> Result<TcpStream> {
        loop {
            let popped = lock(self.queue(nonblocking)).pop_front();
            let Some(stream) = popped else { break };
            if is_connected(&stream, nonblocking) {
                trace!(nonblocking, "reusing pooled connection");
                return Ok(stream);
            }
            debug!("discarding dead pooled connection");
        }
        self.connect(addrs, nonblocking)
    }

    /// Queues `stream` for reuse; closes it when the sync queue is full.
    pub fn release(&self, stream: TcpStream, nonblocking: bool) {
        let mut queue = lock(self.queue(nonblocking));
        if !nonblocking && queue.len() >= self.max_sync {
            trace!(max = self.max_sync, "pool full, closing connection");
            return;
        }
        queue.push_back(stream);
    }

    /// Closes every queued connection.
    pub fn drain(&self) -> usize {
        let closed = lock(&self.sync).drain(..).count() + lock(&self.nonblocking).drain(..).count();
        if closed > 0 {
            debug!(closed, "drained connection pool");
        }
        closed
    }

    pub fn idle(&self, nonblocking: bool) -> usize {
        lock(self.queue(nonblocking)).len()
    }

    /// Connections this pool has opened over its lifetime.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    fn connect(&self, addrs: &[SocketAddr], nonblocking: bool) -> Result<TcpStream> {
        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    let configured = stream
                        .set_nodelay(true)
                        .and_then(|()| stream.set_nonblocking(nonblocking));
                    if let Err(err) = configured {
                        last_err = Some(err);
                        continue;
                    }
                    self.opened.fetch_add(1, Ordering::Relaxed);
                    debug!(addr = %addr, nonblocking, "opened connection");
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(addr = %addr, error = %err, "connect failed");
                    last_err = Some(err);
                }
            }
        }
        Err(Error::Connection(match last_err {
            Some(err) => format!("no address of {addrs:?} accepted a connection: {err}"),
            None => "node has no addresses".to_owned(),
        }))
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.drain();
    }
}

fn lock(queue: &Mutex<VecDeque<TcpStream>>) -> std::sync::MutexGuard<'_, VecDeque<TcpStream>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Non-blocking peek: `Ok(0)` means the peer closed, `WouldBlock` means
/// idle and healthy. Unread bytes on an idle socket would desync the next
/// transaction, so those count as dead too.
fn is_connected(stream: &TcpStream, keep_nonblocking: bool) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(_) => false,
        Err(err) => err.kind() == io::ErrorKind::WouldBlock,
    };
    alive && (keep_nonblocking || stream.set_nonblocking(false).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn release_then_acquire_reuses_the_connection() {
        let (listener, addr) = listener();
        let pool = ConnectionPool::new(4, Duration::from_secs(1));

        let first = pool.acquire(&[addr], false).unwrap();
        let (_server_side, _) = listener.accept().unwrap();
        let local = first.local_addr().unwrap();
        assert_eq!(pool.opened(), 1);

        pool.release(first, false);
        assert_eq!(pool.idle(false), 1);

        let again = pool.acquire(&[addr], false).unwrap();
        assert_eq!(again.local_addr().unwrap(), local);
        assert_eq!(pool.opened(), 1);
        assert_eq!(pool.idle(false), 0);
    }

    #[test]
    fn sync_queue_is_capped_but_async_is_not() {
        let (listener, addr) = listener();
        let pool = ConnectionPool::new(1, Duration::from_secs(1));
        let mut accepted = Vec::new();
        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(pool.acquire(&[addr], false).unwrap());
            accepted.push(listener.accept().unwrap());
        }
        for stream in streams {
            pool.release(stream, false);
        }
        assert_eq!(pool.idle(false), 1);

        let mut nonblocking = Vec::new();
        for _ in 0..3 {
            nonblocking.push(pool.acquire(&[addr], true).unwrap());
            accepted.push(listener.accept().unwrap());
        }
        for stream in nonblocking {
            pool.release(stream, true);
        }
        assert_eq!(pool.idle(true), 3);
        assert_eq!(pool.opened(), 6);
        assert_eq!(pool.drain(), 4);
        assert_eq!(pool.idle(false) + pool.idle(true), 0);
    }

    #[test]
    fn dead_connections_are_replaced() {
        let (listener, addr) = listener();
        let pool = ConnectionPool::new(4, Duration::from_secs(1));
        let stream = pool.acquire(&[addr], false).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        pool.release(stream, false);

        drop(server_side);
        thread::sleep(Duration::from_millis(50));

        let fresh = pool.acquire(&[addr], false).unwrap();
        let _accepted = listener.accept().unwrap();
        assert_eq!(pool.opened(), 2);
        drop(fresh);
    }

    #[test]
    fn falls_through_to_the_next_address() {
        let (listener, good) = listener();
        let dead = {
            let (closed, addr) = self::listener();
            drop(closed);
            addr
        };
        let pool = ConnectionPool::new(4, Duration::from_millis(500));
        let stream = pool.acquire(&[dead, good], false).unwrap();
        let _accepted = listener.accept().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good);
    }

    #[test]
    fn no_reachable_address_is_a_connection_error() {
        let pool = ConnectionPool::new(4, Duration::from_millis(200));
        assert!(matches!(pool.acquire(&[], false), Err(Error::Connection(_))));
    }
}
