//! Bucketed catalog of known peer addresses.
//!
//! The directory is not the live-connection map. It holds addresses the node
//! has heard about, split into two tiers: *new* (never vouched by a
//! successful connection) and *tried* (a status fetch succeeded at least
//! once). Entries land in a bucket chosen deterministically from the peer's
//! IP and a per-node secret, so an attacker cannot target a specific bucket
//! without knowing the secret. A full bucket evicts a uniformly random
//! entry.

use crate::info::{PeerId, PeerInfo};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::debug;

/// Directory sizing and the bucketing secret.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Number of buckets in the new tier.
    pub new_bucket_count: usize,
    /// Number of buckets in the tried tier.
    pub tried_bucket_count: usize,
    /// Maximum entries per bucket.
    pub bucket_size: usize,
    /// Per-node secret mixed into the bucket function.
    pub secret: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            new_bucket_count: 128,
            tried_bucket_count: 64,
            bucket_size: 32,
            secret: rand::random(),
        }
    }
}

/// Which tier an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTier {
    New,
    Tried,
}

/// Two-tier bucketed set of known peers, unique by peer id.
pub struct PeerDirectory {
    config: DirectoryConfig,
    new: Vec<HashMap<PeerId, PeerInfo>>,
    tried: Vec<HashMap<PeerId, PeerInfo>>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new(config: DirectoryConfig) -> Self {
        let new = (0..config.new_bucket_count.max(1)).map(|_| HashMap::new()).collect();
        let tried = (0..config.tried_bucket_count.max(1)).map(|_| HashMap::new()).collect();
        Self { config, new, tried }
    }

    /// Deterministic bucket index for an IP address.
    ///
    /// The low 32 bits of `Blake2b-256(secret || ip)` reduced modulo the
    /// bucket count.
    pub fn bucket(ip_address: &str, secret: u64, bucket_count: usize) -> usize {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(secret.to_le_bytes());
        hasher.update(ip_address.as_bytes());
        let digest = hasher.finalize();
        let n = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        n as usize % bucket_count.max(1)
    }

    /// Add a peer to the new tier. An entry already present in either tier
    /// is updated in place instead.
    pub fn add_new(&mut self, info: PeerInfo) {
        if self.update(&info) {
            return;
        }
        let bucket = Self::bucket(&info.ip_address, self.config.secret, self.new.len());
        let size = self.config.bucket_size;
        Self::insert(&mut self.new[bucket], info, size);
    }

    /// Move a peer into the tried tier, recording its latest info. Called
    /// after a successful status fetch.
    pub fn promote(&mut self, info: PeerInfo) {
        let id = info.peer_id();
        let new_bucket = Self::bucket(&info.ip_address, self.config.secret, self.new.len());
        self.new[new_bucket].remove(&id);

        let tried_bucket = Self::bucket(&info.ip_address, self.config.secret, self.tried.len());
        let size = self.config.bucket_size;
        Self::insert(&mut self.tried[tried_bucket], info, size);
    }

    /// Remove a peer from whichever tier holds it.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        for bucket in self.new.iter_mut().chain(self.tried.iter_mut()) {
            if bucket.remove(id).is_some() {
                return true;
            }
        }
        false
    }

    /// Locate a peer: its tier and bucket index.
    pub fn find(&self, id: &PeerId) -> Option<(PeerTier, usize)> {
        for (index, bucket) in self.new.iter().enumerate() {
            if bucket.contains_key(id) {
                return Some((PeerTier::New, index));
            }
        }
        for (index, bucket) in self.tried.iter().enumerate() {
            if bucket.contains_key(id) {
                return Some((PeerTier::Tried, index));
            }
        }
        None
    }

    /// Look up a peer's stored info.
    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.new
            .iter()
            .chain(self.tried.iter())
            .find_map(|bucket| bucket.get(id).cloned())
    }

    /// Update a stored entry in place. Returns false if the peer is unknown.
    pub fn update(&mut self, info: &PeerInfo) -> bool {
        let id = info.peer_id();
        for bucket in self.new.iter_mut().chain(self.tried.iter_mut()) {
            if let Some(entry) = bucket.get_mut(&id) {
                *entry = info.clone();
                return true;
            }
        }
        false
    }

    /// A random sample of known peers for new connections, tried tier first.
    pub fn candidates(&self, limit: usize) -> Vec<PeerInfo> {
        let mut rng = rand::thread_rng();

        let mut tried: Vec<PeerInfo> = self.tried.iter().flat_map(|b| b.values().cloned()).collect();
        tried.shuffle(&mut rng);
        let mut fresh: Vec<PeerInfo> = self.new.iter().flat_map(|b| b.values().cloned()).collect();
        fresh.shuffle(&mut rng);

        tried.extend(fresh);
        tried.truncate(limit);
        tried
    }

    /// Number of entries in the new tier.
    pub fn new_count(&self) -> usize {
        self.new.iter().map(HashMap::len).sum()
    }

    /// Number of entries in the tried tier.
    pub fn tried_count(&self) -> usize {
        self.tried.iter().map(HashMap::len).sum()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.new_count() + self.tried_count()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(bucket: &mut HashMap<PeerId, PeerInfo>, info: PeerInfo, bucket_size: usize) {
        if bucket.len() >= bucket_size.max(1) {
            let victims: Vec<PeerId> = bucket.keys().cloned().collect();
            if let Some(victim) = victims.choose(&mut rand::thread_rng()) {
                debug!(peer = %victim, "evicting directory entry from full bucket");
                bucket.remove(victim);
            }
        }
        bucket.insert(info.peer_id(), info);
    }
}
