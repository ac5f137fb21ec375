//! Bridge-learning table (`SPEC_FULL.md` §3 "Bridge table", §4.7 step 2,
//! "Aging").
//!
//! Keyed by source MAC, bounded by `max_entries` (default 512); LRU eviction
//! on insert when full, periodic aging sweep, and a targeted flush used by
//! the failover supervisor when a NIC goes away.

use hashbrown::HashMap;
use log::debug;

use crate::clock::Instant;
use crate::wire::Mac;

pub const DEFAULT_MAX_ENTRIES: usize = 512;
pub const DEFAULT_AGING_MS: u32 = 300_000;

#[derive(Debug, Copy, Clone)]
pub struct BridgeEntry {
    pub nic: u8,
    pub last_seen: Instant,
    pub packet_count: u32,
}

pub struct BridgeTable {
    entries: HashMap<Mac, BridgeEntry, ahash::RandomState>,
    max_entries: usize,
    pub evictions: u32,
}

impl BridgeTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
            max_entries,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, mac: &Mac) -> Option<BridgeEntry> {
        self.entries.get(mac).copied()
    }

    /// `bridge_table[src_mac] <- (source_nic, now)` (`§4.7` step 2).
    /// Evicts the entry with the oldest `last_seen` if the table is full and
    /// `mac` is not already present.
    pub fn learn(&mut self, mac: Mac, nic: u8, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&mac) {
            entry.nic = nic;
            entry.last_seen = now;
            entry.packet_count += 1;
            return;
        }

        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(
            mac,
            BridgeEntry { nic, last_seen: now, packet_count: 1 },
        );
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen.0)
            .map(|(mac, _)| *mac);
        if let Some(mac) = oldest {
            self.entries.remove(&mac);
            self.evictions += 1;
            debug!("bridge: evicted oldest entry, table full at {} entries", self.max_entries);
        }
    }

    /// Periodic sweep (`§4.7` "Aging"): drops entries whose `last_seen` is
    /// older than `aging_ms`. Returns the number of entries removed.
    pub fn age(&mut self, now: Instant, aging_ms: u32) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.elapsed_since(entry.last_seen) <= aging_ms);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("bridge: aged out {removed} entries older than {aging_ms}ms");
        }
        removed
    }

    /// Removes every entry pointing at `nic` (failover supervisor, `§4.8`:
    /// "flush bridge entries that pointed to the failing NIC").
    pub fn flush_nic(&mut self, nic: u8) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.nic != nic);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("bridge: flushed {removed} entries pointing at nic {nic}");
        }
        removed
    }
}
