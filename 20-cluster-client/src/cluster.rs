//! Topology manager: node discovery, the tend loop, and node selection.
//!
//! # Tend pass
//!
//! One pass, run every `tend_interval` by a dedicated thread (and on demand
//! by [`Cluster::add_host`]):
//!
//! 1. Resolve the seed hosts and ping every address no node owns yet.
//! 2. Fetch the partition count once.
//! 3. Probe each node for name, partition generation and services; re-read
//!    its ownership bitmaps when the generation moved.
//! 4. Follow announced services to discover the rest of the cluster.
//! 5. Age nodes missing from the partition map and retire the stale ones.
//!
//! Passes are serialized: a pass that finds another in progress is skipped.
//! The topology lock is held only around lookups and updates, never across
//! network I/O, so transactions selecting nodes are never blocked on a slow
//! info probe.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, Host};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::partition::PartitionTable;
use crate::protocol::info::{self, InfoResponse, NamespaceBitmap};

/// Lifecycle of a cluster handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Created, no tend pass has completed yet.
    Initializing,
    /// A tend pass is running.
    Tending,
    /// Between tend passes.
    Quiescent,
    /// `shutdown` was called; terminal.
    ShuttingDown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Initializing => "initializing",
            ClusterState::Tending => "tending",
            ClusterState::Quiescent => "quiescent",
            ClusterState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// A known node plus its liveness bookkeeping.
struct NodeEntry {
    node: Arc<Node>,
    absence_count: u32,
}

impl NodeEntry {
    /// Records one tend pass worth of presence. Returns true once the node
    /// has been missing for more than `max_absent` consecutive passes.
    fn age(&mut self, present: bool, max_absent: u32) -> bool {
        if present {
            self.absence_count = 0;
            return false;
        }
        self.absence_count += 1;
        self.absence_count > max_absent
    }
}

/// Everything guarded by the topology lock.
struct Topology {
    nodes: Vec<NodeEntry>,
    partitions: Option<PartitionTable>,
}

impl Topology {
    fn node_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|entry| entry.node.has_addr(addr))
            .map(|entry| Arc::clone(&entry.node))
    }

    fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|entry| entry.node.name() == name)
            .map(|entry| Arc::clone(&entry.node))
    }
}

/// Runtime-adjustable settings, copied out at the start of each pass.
#[derive(Clone)]
struct Settings {
    hosts: Vec<Host>,
    addr_map: HashMap<String, String>,
    tend_interval: Duration,
    info_timeout: Duration,
    connect_timeout: Duration,
    max_conns_per_node: usize,
    follow: bool,
    max_intervals_absent: u32,
    add_host_timeout: Duration,
}

impl From<ClusterConfig> for Settings {
    fn from(config: ClusterConfig) -> Self {
        Self {
            hosts: config.hosts,
            addr_map: config.addr_map,
            tend_interval: config.tend_interval,
            info_timeout: config.info_timeout,
            connect_timeout: config.connect_timeout,
            max_conns_per_node: config.max_conns_per_node,
            follow: config.follow,
            max_intervals_absent: config.max_intervals_absent,
            add_host_timeout: config.add_host_timeout,
        }
    }
}

struct Inner {
    settings: Mutex<Settings>,
    topology: Mutex<Topology>,
    state: Mutex<ClusterState>,
    tend_lock: Mutex<()>,
    found_all: AtomicBool,
}

struct Tender {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// A handle on one cluster.
///
/// Created with [`Cluster::new`], shared by reference or `Arc`, and torn
/// down with [`Cluster::shutdown`] (or by dropping the last owner).
pub struct Cluster {
    inner: Arc<Inner>,
    tender: Mutex<Option<Tender>>,
}

impl Cluster {
    /// Builds the handle, runs one tend pass over the configured seeds and
    /// starts the background tender.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let seeded = !config.hosts.is_empty();
        let inner = Arc::new(Inner {
            settings: Mutex::new(Settings::from(config)),
            topology: Mutex::new(Topology {
                nodes: Vec::new(),
                partitions: None,
            }),
            state: Mutex::new(ClusterState::Initializing),
            tend_lock: Mutex::new(()),
            found_all: AtomicBool::new(false),
        });
        if seeded {
            inner.tend(true);
        }
        let tender = spawn_tender(Arc::clone(&inner))?;
        Ok(Self {
            inner,
            tender: Mutex::new(Some(tender)),
        })
    }

    /// Adds a seed host and waits, for at most `timeout`, until the tender
    /// has discovered the cluster behind it.
    ///
    /// A zero `timeout` uses the configured `add_host_timeout`. Fails with a
    /// timeout if none of the host's addresses belongs to a live node when
    /// the wait ends.
    pub fn add_host(&self, name: &str, port: u16, timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        let host = Host::new(name, port);
        let addrs = resolve(&host)?;
        let timeout = {
            let mut settings = lock(&self.inner.settings);
            if settings.hosts.contains(&host) {
                return Ok(());
            }
            settings.hosts.push(host.clone());
            if timeout.is_zero() {
                settings.add_host_timeout
            } else {
                timeout
            }
        };
        self.inner.found_all.store(false, Ordering::Release);
        debug!(host = %host, "host added");

        let start = Instant::now();
        self.inner.tend(true);
        while !self.settled() && start.elapsed() < timeout {
            thread::sleep(Duration::from_millis(1));
            self.inner.tend(true);
        }

        let topology = lock(&self.inner.topology);
        if addrs.iter().any(|addr| topology.node_by_addr(addr).is_some()) {
            Ok(())
        } else {
            Err(Error::Timeout(format!("host {host} did not join the cluster")))
        }
    }

    /// Announced services naming `orig` are dialled at `alt` instead.
    pub fn add_addr_map(&self, orig: impl Into<String>, alt: impl Into<String>) {
        lock(&self.inner.settings)
            .addr_map
            .insert(orig.into(), alt.into());
    }

    /// Changes the info probe timeout. Zero is rejected and the old value kept.
    pub fn set_info_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("info timeout must be positive".into()));
        }
        lock(&self.inner.settings).info_timeout = timeout;
        Ok(())
    }

    /// Takes effect after the tender's current sleep.
    pub fn set_tend_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument("tend interval must be positive".into()));
        }
        lock(&self.inner.settings).tend_interval = interval;
        Ok(())
    }

    pub fn set_follow(&self, follow: bool) {
        lock(&self.inner.settings).follow = follow;
    }

    pub fn info_timeout(&self) -> Duration {
        lock(&self.inner.settings).info_timeout
    }

    pub fn state(&self) -> ClusterState {
        *lock(&self.inner.state)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state() == ClusterState::ShuttingDown
    }

    /// True once a tend pass found no service address left to dial.
    pub fn settled(&self) -> bool {
        self.inner.found_all.load(Ordering::Acquire)
    }

    /// Runs a tend pass now, waiting for one in progress to finish first.
    pub fn tend_now(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.tend(true);
        Ok(())
    }

    pub fn n_partitions(&self) -> Option<u32> {
        lock(&self.inner.topology)
            .partitions
            .as_ref()
            .map(PartitionTable::n_partitions)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.inner.topology)
            .nodes
            .iter()
            .map(|entry| Arc::clone(&entry.node))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        lock(&self.inner.topology).nodes.len()
    }

    pub fn node_names(&self) -> Vec<String> {
        lock(&self.inner.topology)
            .nodes
            .iter()
            .map(|entry| entry.node.name().to_owned())
            .collect()
    }

    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        lock(&self.inner.topology).node_by_name(name)
    }

    /// Uniformly random live node.
    pub fn random_node(&self) -> Option<Arc<Node>> {
        random_live(&lock(&self.inner.topology))
    }

    /// Node to send a transaction on `digest` to.
    ///
    /// Partition-aware when the owner is known, otherwise any live node.
    pub fn node_for(&self, namespace: &str, digest: &Digest, for_write: bool) -> Result<Arc<Node>> {
        let topology = lock(&self.inner.topology);
        let owner = topology.partitions.as_ref().and_then(|table| {
            let pid = digest.partition_id(table.n_partitions());
            table.get_node(namespace, pid, for_write)
        });
        owner
            .filter(|node| !node.is_retired())
            .or_else(|| random_live(&topology))
            .ok_or_else(|| Error::ClusterUnavailable {
                namespace: namespace.to_owned(),
            })
    }

    /// Partition ids `node` masters in `namespace`, per the current table.
    pub fn masters_of(&self, namespace: &str, node: &Arc<Node>) -> Vec<u32> {
        lock(&self.inner.topology)
            .partitions
            .as_ref()
            .map(|table| table.masters_of(namespace, node))
            .unwrap_or_default()
    }

    /// Runs info commands against a random node.
    pub fn info(&self, names: &[&str]) -> Result<InfoResponse> {
        self.ensure_running()?;
        let node = self
            .random_node()
            .ok_or_else(|| Error::Connection("cluster has no live nodes".into()))?;
        node.info(names, self.info_timeout())
    }

    /// Stops the tender, retires every node and closes all pooled sockets.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ClusterState::ShuttingDown {
                return;
            }
            *state = ClusterState::ShuttingDown;
        }
        if let Some(tender) = lock(&self.tender).take() {
            let _ = tender.stop_tx.send(());
            if tender.handle.join().is_err() {
                warn!("tend thread panicked");
            }
        }
        let _pass = lock(&self.inner.tend_lock);
        let mut topology = lock(&self.inner.topology);
        for entry in topology.nodes.drain(..) {
            entry.node.retire();
        }
        topology.partitions = None;
        info!("cluster shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state())
            .field("nodes", &self.node_names())
            .field("n_partitions", &self.n_partitions())
            .finish()
    }
}

/// Runs a single info request against `host:port`, trying each resolved
/// address until one answers.
pub fn info_host(host: &str, port: u16, names: &[&str], timeout: Duration) -> Result<InfoResponse> {
    let mut last = None;
    for addr in resolve(&Host::new(host, port))? {
        match info::request(addr, names, timeout) {
            Ok(response) => return Ok(response),
            Err(err) => last = Some(err),
        }
    }
    Err(last.unwrap_or_else(|| Error::Connection(format!("{host}:{port} has no addresses"))))
}

fn spawn_tender(inner: Arc<Inner>) -> Result<Tender> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("cluster-tend".into())
        .spawn(move || {
            loop {
                let interval = lock(&inner.settings).tend_interval;
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => inner.tend(false),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("tend thread exiting");
        })
        .map_err(|err| Error::from_io(err, "spawn tend thread"))?;
    Ok(Tender { stop_tx, handle })
}

impl Inner {
    /// One tend pass. With `wait` false a pass already in progress makes
    /// this a no-op.
    fn tend(&self, wait: bool) {
        let _pass = match self.tend_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) if wait => lock(&self.tend_lock),
            Err(TryLockError::WouldBlock) => {
                debug!("tend pass already running, skipping");
                return;
            }
        };
        if !self.enter_state(ClusterState::Tending) {
            return;
        }

        let settings = lock(&self.settings).clone();

        let mut seeds = Vec::new();
        for host in &settings.hosts {
            match resolve(host) {
                Ok(addrs) => seeds.extend(addrs),
                Err(err) => warn!(host = %host, error = %err, "cannot resolve seed host"),
            }
        }
        self.ping_addrs(&seeds, &settings);

        self.fetch_partition_count(&settings);

        let mut services = Vec::new();
        for node in self.live_nodes() {
            services.extend(self.refresh_node(&node, &settings));
        }

        let unknown: Vec<SocketAddr> = {
            let topology = lock(&self.topology);
            let mut unknown: Vec<SocketAddr> = services
                .into_iter()
                .filter(|addr| topology.node_by_addr(addr).is_none())
                .collect();
            unknown.sort_unstable();
            unknown.dedup();
            unknown
        };
        if settings.follow && !unknown.is_empty() {
            debug!(count = unknown.len(), "following announced services");
            self.ping_addrs(&unknown, &settings);
        }
        self.found_all
            .store(!settings.follow || unknown.is_empty(), Ordering::Release);

        self.age_nodes(settings.max_intervals_absent);
        self.enter_state(ClusterState::Quiescent);
    }

    /// Moves to `next` unless shutting down. Returns false when shut down.
    fn enter_state(&self, next: ClusterState) -> bool {
        let mut state = lock(&self.state);
        if *state == ClusterState::ShuttingDown {
            return false;
        }
        *state = next;
        true
    }

    fn live_nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.topology)
            .nodes
            .iter()
            .map(|entry| Arc::clone(&entry.node))
            .collect()
    }

    /// Asks each unowned address for its node name, then registers it as a
    /// new node or as an alternate address of a known one.
    fn ping_addrs(&self, addrs: &[SocketAddr], settings: &Settings) {
        for addr in addrs {
            if lock(&self.topology).node_by_addr(addr).is_some() {
                continue;
            }
            let name = match info::request(*addr, &[info::NODE], settings.info_timeout) {
                Ok(response) => match response.non_empty(info::NODE) {
                    Some(name) => name.to_owned(),
                    None => {
                        warn!(addr = %addr, "address answered without a node name");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(addr = %addr, error = %err, "node ping failed");
                    continue;
                }
            };

            let mut topology = lock(&self.topology);
            match topology.node_by_name(&name) {
                Some(node) => {
                    node.add_addr(*addr);
                }
                None => {
                    let node = Arc::new(Node::new(
                        name,
                        *addr,
                        settings.max_conns_per_node,
                        settings.connect_timeout,
                    ));
                    info!(node = %node, addr = %addr, "node added");
                    topology.nodes.push(NodeEntry {
                        node,
                        absence_count: 0,
                    });
                }
            }
        }
    }

    fn fetch_partition_count(&self, settings: &Settings) {
        if lock(&self.topology).partitions.is_some() {
            return;
        }
        for node in self.live_nodes() {
            let count = match node.info(&[info::PARTITIONS], settings.info_timeout) {
                Ok(response) => response.parse_u32(info::PARTITIONS),
                Err(err) => {
                    warn!(node = %node, error = %err, "partition count request failed");
                    continue;
                }
            };
            match count {
                Some(n) if n > 0 => {
                    info!(n_partitions = n, "partition count fetched");
                    lock(&self.topology).partitions = Some(PartitionTable::new(n));
                    return;
                }
                _ => warn!(node = %node, "node returned no usable partition count"),
            }
        }
    }

    /// Probes one node and refreshes its partitions when needed. Returns the
    /// service addresses it announced.
    fn refresh_node(&self, node: &Arc<Node>, settings: &Settings) -> Vec<SocketAddr> {
        let response = match node.info(info::CHECK, settings.info_timeout) {
            Ok(response) => response,
            Err(err) => {
                warn!(node = %node, error = %err, "node check failed");
                return Vec::new();
            }
        };

        match response.non_empty(info::NODE) {
            Some(name) if name == node.name() => {}
            Some(name) => {
                warn!(node = %node, reported = %name, "node name changed, ignoring node this pass");
                return Vec::new();
            }
            None => {
                warn!(node = %node, "node check returned no name");
                return Vec::new();
            }
        }

        if let Some(generation) = response.parse_u32("partition-generation") {
            if generation != node.partition_generation() {
                debug!(node = %node, generation, "partition generation changed");
                self.refresh_partitions(node, settings);
            }
        }

        let Some(services) = response.non_empty("services") else {
            return Vec::new();
        };
        info::parse_services(services)
            .into_iter()
            .filter_map(|(host, port)| {
                let host = settings.addr_map.get(&host).cloned().unwrap_or(host);
                match resolve(&Host::new(host.clone(), port)) {
                    Ok(addrs) => Some(addrs),
                    Err(err) => {
                        debug!(host = %host, port, error = %err, "cannot resolve service");
                        None
                    }
                }
            })
            .flatten()
            .collect()
    }

    fn refresh_partitions(&self, node: &Arc<Node>, settings: &Settings) {
        let Some(n_partitions) = lock(&self.topology).partitions.as_ref().map(PartitionTable::n_partitions) else {
            return;
        };
        let response = match node.info(info::REPLICAS, settings.info_timeout) {
            Ok(response) => response,
            Err(err) => {
                debug!(node = %node, error = %err, "replicas request failed");
                return;
            }
        };
        let masters = response
            .get("replicas-master")
            .map(|value| info::parse_replicas(value, n_partitions))
            .unwrap_or_default();
        let proles = response
            .get("replicas-prole")
            .map(|value| info::parse_replicas(value, n_partitions))
            .unwrap_or_default();

        {
            let mut topology = lock(&self.topology);
            let Some(table) = topology.partitions.as_mut() else {
                return;
            };
            let mut namespaces: Vec<&str> = masters
                .iter()
                .chain(&proles)
                .map(|map| map.namespace.as_str())
                .collect();
            namespaces.sort_unstable();
            namespaces.dedup();

            // A namespace missing from one map owns nothing in it.
            for namespace in &namespaces {
                table.update(
                    namespace,
                    node,
                    bitmap_for(&masters, namespace),
                    bitmap_for(&proles, namespace),
                );
            }
            debug!(node = %node, namespaces = namespaces.len(), "partitions refreshed");
        }
        if let Some(generation) = response.parse_u32("partition-generation") {
            node.set_partition_generation(generation);
        }
    }

    fn age_nodes(&self, max_absent: u32) {
        let mut topology = lock(&self.topology);
        let Topology { nodes, partitions } = &mut *topology;
        let Some(table) = partitions.as_mut() else {
            return;
        };
        nodes.retain_mut(|entry| {
            let present = table.is_node_present(&entry.node);
            if !entry.age(present, max_absent) {
                return true;
            }
            info!(node = %entry.node, absent = entry.absence_count, "node removed");
            table.remove_node(&entry.node);
            entry.node.retire();
            false
        });
    }
}

fn bitmap_for<'a>(maps: &'a [NamespaceBitmap], namespace: &str) -> &'a [u8] {
    maps.iter()
        .find(|map| map.namespace == namespace)
        .map(|map| map.bitmap.as_slice())
        .unwrap_or_default()
}

fn random_live(topology: &Topology) -> Option<Arc<Node>> {
    let live: Vec<&NodeEntry> = topology
        .nodes
        .iter()
        .filter(|entry| !entry.node.is_retired())
        .collect();
    live.choose(&mut rand::thread_rng())
        .map(|entry| Arc::clone(&entry.node))
}

fn resolve(host: &Host) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host.name.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|err| Error::InvalidArgument(format!("cannot resolve {host}: {err}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::InvalidArgument(format!("{host} resolved to no addresses")));
    }
    Ok(addrs)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> NodeEntry {
        NodeEntry {
            node: Arc::new(Node::new(
                "A",
                "127.0.0.1:3000".parse().unwrap(),
                1,
                Duration::from_millis(100),
            )),
            absence_count: 0,
        }
    }

    #[test]
    fn node_is_retired_after_threshold_plus_one_absences() {
        let mut e = entry();
        assert!(!e.age(false, 1));
        assert!(e.age(false, 1));

        let mut e = entry();
        assert!(!e.age(false, 1));
        assert!(!e.age(true, 1));
        assert!(!e.age(false, 1));
        assert_eq!(e.absence_count, 1);
    }

    #[test]
    fn empty_cluster_has_no_nodes() {
        let cluster = Cluster::new(ClusterConfig::default()).unwrap();
        assert_eq!(cluster.state(), ClusterState::Initializing);
        assert_eq!(cluster.node_count(), 0);
        assert!(cluster.random_node().is_none());
        assert!(cluster.n_partitions().is_none());
        let digest = Digest([0u8; 20]);
        assert!(matches!(
            cluster.node_for("test", &digest, true),
            Err(Error::ClusterUnavailable { .. })
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let cluster = Cluster::new(ClusterConfig::default()).unwrap();
        let before = cluster.info_timeout();
        assert!(cluster.set_info_timeout(Duration::ZERO).is_err());
        assert_eq!(cluster.info_timeout(), before);
        cluster.set_info_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(cluster.info_timeout(), Duration::from_millis(50));
        assert!(cluster.set_tend_interval(Duration::ZERO).is_err());
    }

    #[test]
    fn shutdown_is_terminal_and_idempotent() {
        let cluster = Cluster::new(
            ClusterConfig::default().with_tend_interval(Duration::from_millis(10)),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        cluster.shutdown();
        cluster.shutdown();
        assert_eq!(cluster.state(), ClusterState::ShuttingDown);
        assert!(matches!(cluster.tend_now(), Err(Error::Shutdown)));
        assert!(matches!(
            cluster.add_host("127.0.0.1", 3000, Duration::ZERO),
            Err(Error::Shutdown)
        ));
    }
}
