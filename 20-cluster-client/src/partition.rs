//! Namespace and partition id to owning node.
//!
//! Entries hold `Weak<Node>` so the table never keeps a retired node alive;
//! a dangling entry simply reads as unmapped. The table itself is not
//! synchronized: it lives inside the cluster's state lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use rand::Rng;
use tracing::debug;

use crate::node::Node;
use crate::protocol::info::bitmap_has;

#[derive(Debug, Default, Clone)]
struct Partition {
    master: Option<Weak<Node>>,
    replicas: Vec<Weak<Node>>,
}

fn is_node(weak: &Weak<Node>, node: &Arc<Node>) -> bool {
    std::ptr::eq(weak.as_ptr(), Arc::as_ptr(node))
}

impl Partition {
    fn master(&self) -> Option<Arc<Node>> {
        self.master.as_ref().and_then(Weak::upgrade)
    }

    fn live_replicas(&self) -> Vec<Arc<Node>> {
        self.replicas.iter().filter_map(Weak::upgrade).collect()
    }

    fn forget(&mut self, node: &Arc<Node>) {
        if self.master.as_ref().is_some_and(|m| is_node(m, node)) {
            self.master = None;
        }
        self.replicas.retain(|r| !is_node(r, node));
    }
}

#[derive(Debug)]
pub struct PartitionTable {
    n_partitions: u32,
    namespaces: HashMap<String, Vec<Partition>>,
}

impl PartitionTable {
    pub fn new(n_partitions: u32) -> Self {
        Self {
            n_partitions,
            namespaces: HashMap::new(),
        }
    }

    pub fn n_partitions(&self) -> u32 {
        self.n_partitions
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Master for writes; for reads a uniformly chosen owner among the
    /// master and its replicas. `None` when the partition is unmapped.
    pub fn get_node(&self, namespace: &str, partition_id: u32, for_write: bool) -> Option<Arc<Node>> {
        let partition = self.namespaces.get(namespace)?.get(partition_id as usize)?;
        let master = partition.master();
        if for_write {
            return master;
        }
        let mut owners = partition.live_replicas();
        if owners.is_empty() {
            return master;
        }
        if let Some(master) = master {
            owners.push(master);
        }
        let pick = rand::thread_rng().gen_range(0..owners.len());
        Some(owners.swap_remove(pick))
    }

    /// Applies `node`'s own ownership report for `namespace`.
    ///
    /// The node's previous claims in this namespace are replaced. A master
    /// it takes over from another node displaces that node, whose partition
    /// generation is reset so its next report is re-read.
    pub fn update(&mut self, namespace: &str, node: &Arc<Node>, master_bitmap: &[u8], prole_bitmap: &[u8]) {
        let n = self.n_partitions as usize;
        let partitions = self
            .namespaces
            .entry(namespace.to_owned())
            .or_insert_with(|| vec![Partition::default(); n]);

        let mut displaced: Vec<Arc<Node>> = Vec::new();
        for (pid, partition) in (0u32..).zip(partitions.iter_mut()) {
            partition.forget(node);
            if bitmap_has(master_bitmap, pid) {
                if let Some(previous) = partition.master() {
                    if !displaced.iter().any(|d| Arc::ptr_eq(d, &previous)) {
                        displaced.push(previous);
                    }
                }
                partition.master = Some(Arc::downgrade(node));
            } else if bitmap_has(prole_bitmap, pid) {
                partition.replicas.push(Arc::downgrade(node));
            }
        }

        for other in displaced {
            debug!(namespace, node = %node, displaced = %other, "master displaced, forcing refresh");
            other.force_partition_refresh();
        }
    }

    /// Whether `node` masters any partition. A node that masters nothing
    /// has its replica claims dropped, since its report is no longer trusted.
    pub fn is_node_present(&mut self, node: &Arc<Node>) -> bool {
        let masters_any = self.namespaces.values().any(|partitions| {
            partitions
                .iter()
                .any(|p| p.master.as_ref().is_some_and(|m| is_node(m, node)))
        });
        if !masters_any {
            self.remove_node(node);
        }
        masters_any
    }

    /// Drops every claim `node` holds.
    pub fn remove_node(&mut self, node: &Arc<Node>) {
        for partitions in self.namespaces.values_mut() {
            for partition in partitions.iter_mut() {
                partition.forget(node);
            }
        }
    }

    /// Partition ids `node` masters in `namespace`.
    pub fn masters_of(&self, namespace: &str, node: &Arc<Node>) -> Vec<u32> {
        self.namespaces
            .get(namespace)
            .map(|partitions| {
                (0u32..)
                    .zip(partitions)
                    .filter(|(_, p)| p.master.as_ref().is_some_and(|m| is_node(m, node)))
                    .map(|(pid, _)| pid)
                    .collect()
            })
            .unwrap_or_default()
    }
}
