//! Local key/(subkey → value) store with per-entry TTL, scaled expiration,
//! and replication bookkeeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::{Id, RoutingTable, StoredValue};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    /// Absolute expiration; `None` for a locally-seeded authoritative entry,
    /// which never expires while this node keeps publishing it.
    pub expire: Option<Instant>,
    /// Last time this node replicated the entry to the key's closest nodes.
    pub refreshed_at: Instant,
}

impl CacheEntry {
    /// The expiration instant, with the residual lifetime scaled by
    /// `exp(k / n)` when `n` known contacts closer to the local id than the
    /// key exceed `k`: the local node is then outside the key's nominal
    /// replica set.
    pub fn effective_expiration(
        &self,
        now: Instant,
        closer_nodes: usize,
        k: usize,
    ) -> Option<Instant> {
        let expire = self.expire?;

        if expire <= now || closer_nodes <= k {
            return Some(expire);
        }

        let factor = (k as f64 / closer_nodes as f64).exp();
        Some(now + (expire - now).mul_f64(factor))
    }

    /// Remaining TTL in milliseconds, as sent in store requests.
    pub fn wire_expire(&self, now: Instant) -> Option<u64> {
        self.expire
            .map(|e| e.saturating_duration_since(now).as_millis() as u64)
    }
}

#[derive(Debug, Default)]
/// Two-level store: key Id → subkey → entry.
pub struct Cache {
    entries: HashMap<Id, HashMap<String, CacheEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    // === Getters ===

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of (key, subkey) entries held.
    pub fn len(&self) -> usize {
        self.entries.values().map(|subkeys| subkeys.len()).sum()
    }

    pub fn get(&self, idkey: &Id, subkey: &str) -> Option<&CacheEntry> {
        self.entries.get(idkey)?.get(subkey)
    }

    /// All subkeys held for a key.
    pub fn subkeys(&self, idkey: &Id) -> Option<&HashMap<String, CacheEntry>> {
        self.entries.get(idkey)
    }

    // === Public Methods ===

    /// Write an entry, last-writer-wins per (key, subkey).
    pub fn store(
        &mut self,
        idkey: Id,
        subkey: String,
        value: Bytes,
        expire: Option<Instant>,
        now: Instant,
    ) {
        self.entries.entry(idkey).or_default().insert(
            subkey,
            CacheEntry {
                value,
                expire,
                refreshed_at: now,
            },
        );
    }

    /// Drop every entry whose effective expiration is in the past.
    pub fn expire(&mut self, now: Instant, table: &RoutingTable, k: usize) {
        self.entries.retain(|idkey, subkeys| {
            let closer_nodes = table.count_closest_nodes(idkey);

            subkeys.retain(|_, entry| {
                match entry.effective_expiration(now, closer_nodes, k) {
                    Some(expiration) => expiration > now,
                    None => true,
                }
            });

            !subkeys.is_empty()
        });
    }

    /// Collect the entries due for replication, bumping their `refreshed_at`.
    ///
    /// TTL'd entries replicate on the fast cadence; authoritative
    /// (`expire == None`) entries republish on the slow one, through this
    /// same driver.
    pub fn due_replications(
        &mut self,
        now: Instant,
        replicate_interval: Duration,
        republish_interval: Duration,
    ) -> Vec<(Id, Vec<(String, StoredValue)>)> {
        let mut due = Vec::new();

        for (idkey, subkeys) in self.entries.iter_mut() {
            let mut batch = Vec::new();

            for (subkey, entry) in subkeys.iter_mut() {
                let cadence = if entry.expire.is_none() {
                    republish_interval
                } else {
                    replicate_interval
                };

                if entry.refreshed_at + cadence <= now {
                    entry.refreshed_at = now;
                    batch.push((
                        subkey.clone(),
                        StoredValue {
                            value: entry.value.clone(),
                            expire: entry.wire_expire(now),
                        },
                    ));
                }
            }

            if !batch.is_empty() {
                due.push((*idkey, batch));
            }
        }

        due
    }

    /// The next instant the replication driver needs to wake at: the minimum
    /// due time across the cache, with a ceiling of one replicate interval.
    pub fn next_replication(
        &self,
        now: Instant,
        replicate_interval: Duration,
        republish_interval: Duration,
    ) -> Instant {
        let ceiling = now + replicate_interval;

        self.entries
            .values()
            .flat_map(|subkeys| subkeys.values())
            .map(|entry| {
                entry.refreshed_at
                    + if entry.expire.is_none() {
                        republish_interval
                    } else {
                        replicate_interval
                    }
            })
            .min()
            .map_or(ceiling, |earliest| earliest.min(ceiling))
    }
}
