//! Consistent-hash ring with virtual nodes.
//!
//! The ring is a sequence of [`VirtualNode`] entries sorted by token. Every
//! physical node contributes [`VIRTUAL_NODES_PER_PHYSICAL`] entries whose
//! tokens are derived from its node id, which spreads each node's key ranges
//! around the ring and keeps rebalancing increments small. The node that owns
//! a key is the first entry whose token is at or past the key's hash, and a
//! key's replica set (its preference list) is the walk from that entry
//! forward, collecting distinct physical nodes.
//!
//! The manager is the only writer of the ring; every other actor holds a
//! snapshot received through a `TABLE_PUSH`. Identical snapshots must produce
//! identical preference lists, which is why the hash function below is fixed
//! and ties between equal tokens are broken by node id.
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::io::Cursor;

use murmur3::murmur3_x86_128;
use serde::{Deserialize, Serialize};

pub mod codec;

/// How many ring entries each physical node contributes. Changing this after
/// a ring has been deployed is not supported.
pub const VIRTUAL_NODES_PER_PHYSICAL: u32 = 16;

pub type RingHashFn = fn(&[u8]) -> u64;

/// The fixed 64-bit hash that every actor uses for both key routing and
/// virtual-token generation: the low 64 bits of murmur3_x86_128 with seed 0.
/// The ring only works if every process agrees on this function, so do not
/// swap it for a platform hash.
pub fn ring_hash(data: &[u8]) -> u64 {
    // murmur3 reads from an in-memory cursor; that read cannot fail
    murmur3_x86_128(&mut Cursor::new(data), 0).unwrap() as u64
}

/// A TCP endpoint, formatted as `<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One ring entry contributed by a physical node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNode {
    pub node_id: String,
    pub address: NodeAddress,
    pub token: u64,
}

/// The routing table: the token-sorted ring plus the replication factor.
///
/// Entries sharing a `node_id` all carry the same address; re-inserting a
/// physical node replaces all of its entries atomically.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    ring: Vec<VirtualNode>,
    replication_factor: usize,
    hash_fn: RingHashFn,
}

impl RoutingTable {
    pub fn new(replication_factor: usize) -> Self {
        Self::with_hash_fn(replication_factor, ring_hash)
    }

    /// Mainly a seam for table-driven tests that want predictable tokens.
    pub fn with_hash_fn(replication_factor: usize, hash_fn: RingHashFn) -> Self {
        Self {
            ring: Vec::new(),
            replication_factor: replication_factor.max(1),
            hash_fn,
        }
    }

    /// Rebuilds a table from decoded wire entries.
    pub fn from_parts(entries: Vec<VirtualNode>, replication_factor: usize) -> Self {
        Self::from_parts_with(entries, replication_factor, ring_hash)
    }

    pub fn from_parts_with(
        entries: Vec<VirtualNode>,
        replication_factor: usize,
        hash_fn: RingHashFn,
    ) -> Self {
        let mut table = Self {
            ring: entries,
            replication_factor: replication_factor.max(1),
            hash_fn,
        };
        table.sort();
        table
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn entries(&self) -> &[VirtualNode] {
        &self.ring
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Adds (or re-registers) a physical node: all of its previous entries
    /// are dropped and [`VIRTUAL_NODES_PER_PHYSICAL`] fresh ones inserted in
    /// a single step.
    pub fn insert_physical(&mut self, node_id: &str, address: NodeAddress) {
        self.ring.retain(|entry| entry.node_id != node_id);
        for i in 0..VIRTUAL_NODES_PER_PHYSICAL {
            let seed = format!("{}/{}", node_id, i);
            self.ring.push(VirtualNode {
                node_id: node_id.to_string(),
                address: address.clone(),
                token: (self.hash_fn)(seed.as_bytes()),
            });
        }
        self.sort();
    }

    /// Drops every entry of the given physical node.
    pub fn remove_physical(&mut self, node_id: &str) {
        self.ring.retain(|entry| entry.node_id != node_id);
    }

    pub fn contains_physical(&self, node_id: &str) -> bool {
        self.ring.iter().any(|entry| entry.node_id == node_id)
    }

    /// Distinct physical nodes with their addresses, ordered by node id.
    pub fn physicals(&self) -> Vec<(String, NodeAddress)> {
        let mut seen = BTreeMap::new();
        for entry in &self.ring {
            seen.entry(entry.node_id.clone())
                .or_insert_with(|| entry.address.clone());
        }
        seen.into_iter().collect()
    }

    pub fn distinct_physical_count(&self) -> usize {
        self.physicals().len()
    }

    pub fn address_of(&self, node_id: &str) -> Option<NodeAddress> {
        self.ring
            .iter()
            .find(|entry| entry.node_id == node_id)
            .map(|entry| entry.address.clone())
    }

    pub fn tokens_of(&self, node_id: &str) -> Vec<u64> {
        self.ring
            .iter()
            .filter(|entry| entry.node_id == node_id)
            .map(|entry| entry.token)
            .collect()
    }

    /// The ordered replica set for a key: up to `replication_factor` distinct
    /// physical nodes starting at the key's ring position. This is the only
    /// way any actor picks replicas.
    pub fn preference_list(&self, key: &[u8]) -> Vec<VirtualNode> {
        self.successors(key, self.replication_factor)
    }

    /// First entry of the preference list.
    pub fn primary(&self, key: &[u8]) -> Option<VirtualNode> {
        self.successors(key, 1).into_iter().next()
    }

    /// Walks the ring from the key's position, collecting up to `n` distinct
    /// physical nodes. Used with `n = replication_factor + 1` to find the
    /// replica displaced by a join.
    pub fn successors(&self, key: &[u8], n: usize) -> Vec<VirtualNode> {
        if self.ring.is_empty() || n == 0 {
            return Vec::new();
        }

        let start = self.start_index((self.hash_fn)(key));
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(n);
        for i in 0..self.ring.len() {
            let entry = &self.ring[(start + i) % self.ring.len()];
            if seen.insert(entry.node_id.clone()) {
                out.push(entry.clone());
                if out.len() == n {
                    break;
                }
            }
        }

        out
    }

    /// The first physical node strictly after the given token on the ring,
    /// optionally skipping one node id. This is how rebalancing finds the
    /// neighbor that holds the keys adjacent to a virtual-node position.
    pub fn successor_physical(&self, token: u64, exclude: Option<&str>) -> Option<VirtualNode> {
        if self.ring.is_empty() {
            return None;
        }

        let start = self.ring.partition_point(|entry| entry.token <= token) % self.ring.len();
        for i in 0..self.ring.len() {
            let entry = &self.ring[(start + i) % self.ring.len()];
            if Some(entry.node_id.as_str()) != exclude {
                return Some(entry.clone());
            }
        }

        None
    }

    /// The first physical node strictly before the given token on the ring,
    /// optionally skipping one node id.
    pub fn predecessor_physical(&self, token: u64, exclude: Option<&str>) -> Option<VirtualNode> {
        if self.ring.is_empty() {
            return None;
        }

        let len = self.ring.len();
        let insert_at = self.ring.partition_point(|entry| entry.token < token);
        for i in 1..=len {
            let entry = &self.ring[(insert_at + len - i) % len];
            if Some(entry.node_id.as_str()) != exclude {
                return Some(entry.clone());
            }
        }

        None
    }

    /// Index of the first entry whose token is at or past the hash, wrapping
    /// to the start of the ring when the hash is past every token.
    fn start_index(&self, hash: u64) -> usize {
        self.ring.partition_point(|entry| entry.token < hash) % self.ring.len()
    }

    /// Tokens ascending; equal tokens ordered by node id so that every actor
    /// resolves collisions the same way.
    fn sort(&mut self) {
        self.ring
            .sort_by(|a, b| (a.token, &a.node_id).cmp(&(b.token, &b.node_id)));
    }
}
