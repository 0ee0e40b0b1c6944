//! Cluster configuration and per-transaction policies.
//!
//! [`ClusterConfig`] can be built in code with the `with_*` setters or read
//! from JSON; durations are given in milliseconds there:
//!
//! ```json
//! {
//!   "hosts": [{ "name": "127.0.0.1", "port": 3000 }],
//!   "tend_interval_ms": 1000,
//!   "follow": true
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::codec::Request;
use crate::protocol::wire::{info2, info3};

pub const DEFAULT_TEND_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_INFO_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_ADD_HOST_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_CONNS_PER_NODE: usize = 300;
pub const DEFAULT_MAX_INTERVALS_ABSENT: u32 = 1;

/// Per-I/O-step timeout when a transaction has no deadline.
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_millis(50);

/// Timeouts above this, with retries enabled, are split across two attempts.
const SPLIT_TIMEOUT_THRESHOLD: Duration = Duration::from_millis(700);

/// A seed host: name or IP literal plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Settings for one cluster handle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seed hosts resolved on every tend pass.
    pub hosts: Vec<Host>,
    #[serde(rename = "tend_interval_ms", with = "millis")]
    pub tend_interval: Duration,
    #[serde(rename = "info_timeout_ms", with = "millis")]
    pub info_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Idle sync connections kept per node; extras are closed on release.
    pub max_conns_per_node: usize,
    /// Dial peers announced in `services` replies.
    pub follow: bool,
    /// Tend passes a node may be missing from the partition map before removal.
    pub max_intervals_absent: u32,
    /// Poll interval while `add_host` waits for the tender to settle.
    #[serde(rename = "add_host_timeout_ms", with = "millis")]
    pub add_host_timeout: Duration,
    /// Announced host -> host actually dialled.
    pub addr_map: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            tend_interval: DEFAULT_TEND_INTERVAL,
            info_timeout: DEFAULT_INFO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_conns_per_node: DEFAULT_MAX_CONNS_PER_NODE,
            follow: true,
            max_intervals_absent: DEFAULT_MAX_INTERVALS_ABSENT,
            add_host_timeout: DEFAULT_ADD_HOST_TIMEOUT,
            addr_map: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn with_host(mut self, name: impl Into<String>, port: u16) -> Self {
        self.hosts.push(Host::new(name, port));
        self
    }

    pub fn with_tend_interval(mut self, interval: Duration) -> Self {
        self.tend_interval = interval;
        self
    }

    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_conns_per_node(mut self, max: usize) -> Self {
        self.max_conns_per_node = max;
        self
    }

    pub fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn with_max_intervals_absent(mut self, intervals: u32) -> Self {
        self.max_intervals_absent = intervals;
        self
    }

    pub fn with_add_host_timeout(mut self, timeout: Duration) -> Self {
        self.add_host_timeout = timeout;
        self
    }

    pub fn with_addr_map(mut self, orig: impl Into<String>, alt: impl Into<String>) -> Self {
        self.addr_map.insert(orig.into(), alt.into());
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| Error::InvalidArgument(format!("bad cluster config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.info_timeout.is_zero() {
            return Err(Error::InvalidArgument("info timeout must be positive".into()));
        }
        if self.tend_interval.is_zero() {
            return Err(Error::InvalidArgument("tend interval must be positive".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidArgument("connect timeout must be positive".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// What the executor does after a transport failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RetryPolicy {
    /// Retry from node selection until the deadline passes.
    #[default]
    RetryOnce,
    /// Give up after the first failed attempt.
    NoRetry,
}

/// Deadline and retry behaviour for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Overall budget. `None` means no deadline, with each I/O step bounded
    /// by [`DEFAULT_PROGRESS_TIMEOUT`].
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(1)),
            retry: RetryPolicy::RetryOnce,
        }
    }
}

impl Policy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = RetryPolicy::NoRetry;
        self
    }

    /// Timeout applied to each write or read on the socket.
    pub fn progress_timeout(&self) -> Duration {
        match self.timeout {
            Some(timeout) if timeout.is_zero() => DEFAULT_PROGRESS_TIMEOUT,
            Some(timeout)
                if timeout > SPLIT_TIMEOUT_THRESHOLD && self.retry == RetryPolicy::RetryOnce =>
            {
                timeout / 2
            }
            Some(timeout) => timeout,
            None => DEFAULT_PROGRESS_TIMEOUT,
        }
    }

    pub fn deadline_from(&self, start: Instant) -> Option<Instant> {
        self.timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| start + timeout)
    }
}

/// Existence condition for a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordExists {
    #[default]
    Any,
    CreateOnly,
    UpdateOnly,
    CreateOrReplace,
    ReplaceOnly,
}

/// Generation condition for a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationCheck {
    #[default]
    None,
    Equal(u32),
    Greater(u32),
    Duplicate(u32),
}

/// Write-side options folded into the request header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteParams {
    pub exists: RecordExists,
    pub bin_create_only: bool,
    pub bin_replace_only: bool,
    pub generation: GenerationCheck,
    /// Seconds; zero keeps the namespace default.
    pub record_ttl: u32,
}

impl WriteParams {
    pub fn apply(&self, request: &mut Request) {
        match self.exists {
            RecordExists::Any => {}
            RecordExists::CreateOnly => request.info2 |= info2::CREATE_ONLY,
            RecordExists::UpdateOnly => request.info3 |= info3::UPDATE_ONLY,
            RecordExists::CreateOrReplace => request.info3 |= info3::CREATE_OR_REPLACE,
            RecordExists::ReplaceOnly => request.info3 |= info3::REPLACE_ONLY,
        }
        if self.bin_create_only {
            request.info2 |= info2::BIN_CREATE_ONLY;
        }
        if self.bin_replace_only {
            request.info3 |= info3::BIN_REPLACE_ONLY;
        }
        match self.generation {
            GenerationCheck::None => {}
            GenerationCheck::Equal(generation) => {
                request.info2 |= info2::GENERATION;
                request.generation = generation;
            }
            GenerationCheck::Greater(generation) => {
                request.info2 |= info2::GENERATION_GT;
                request.generation = generation;
            }
            GenerationCheck::Duplicate(generation) => {
                request.info2 |= info2::GENERATION_DUP;
                request.generation = generation;
            }
        }
        request.record_ttl = self.record_ttl;
    }
}
