//! Client core for a partitioned, replicated key-value cluster.
//!
//! A [`Cluster`] discovers the servers behind a set of seed hosts, learns
//! which node masters (and which nodes replicate) each of the namespace's
//! partitions, and routes every single-record transaction to the right node
//! over pooled TCP connections.
//!
//! # Architecture
//!
//! Everything runs on OS threads with blocking, timeout-bounded sockets:
//!
//! - **Tend thread**: one per cluster. Every `tend_interval` it probes each
//!   node over the info protocol, follows announced services to find new
//!   nodes, refreshes partition ownership when a node's partition
//!   generation moves, and retires nodes that stop answering.
//! - **Caller threads**: each call to [`execute_transaction`] runs on the
//!   caller's thread, picks a node from the partition table, borrows a
//!   pooled connection and retries transport failures until its deadline.
//! - **Pool workers**: [`TaskPool`] fans multi-node work (scans) out over a
//!   fixed set of threads; each worker streams records into a bounded
//!   crossbeam channel.
//!
//! Nodes are shared as `Arc<Node>`. The partition table only holds weak
//! references, so a retired node is freed as soon as the last transaction
//! using it finishes.
//!
//! # Modules
//!
//! - [`protocol`]: wire format, typed values and the info sub-protocol
//! - [`digest`]: key digests and partition ids
//! - [`pool`]: per-node connection pool
//! - [`node`]: one cluster member
//! - [`partition`]: partition ownership table
//! - [`cluster`]: topology manager and tend loop
//! - [`executor`]: retrying transaction executor and record streams
//! - [`task_pool`]: worker threads for fan-out calls
//! - [`config`]: cluster settings and per-transaction policy
//! - [`error`]: error kinds and server result codes

use std::sync::Arc;

pub mod cli;
pub mod cluster;
pub mod config;
pub mod digest;
pub mod error;
pub mod executor;
pub mod node;
pub mod partition;
pub mod pool;
pub mod protocol;
pub mod task_pool;

pub use cluster::{Cluster, ClusterState, info_host};
pub use config::{ClusterConfig, GenerationCheck, Host, Policy, RecordExists, RetryPolicy, WriteParams};
pub use digest::{Digest, partition_id};
pub use error::{Error, Result, ResultCode};
pub use executor::{TransactionResult, execute_stream, execute_transaction, scan_nodes, spawn_stream};
pub use node::Node;
pub use protocol::{Bin, Request, Response, ScanOptions, Value};
pub use task_pool::TaskPool;

/// Shared ownership of a cluster, for handing one client to many threads.
pub type ClusterHandle = Arc<Cluster>;
