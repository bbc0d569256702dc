//! Duplicate suppression at the envelope-construction boundary.
//!
//! Webhook platforms deliver at-least-once: the same native message can
//! arrive twice, or out of order. Providers consult this store with the
//! `platform:native_message_id` key before building an envelope, so replays
//! produce at most one logically-distinct envelope on the bus.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory TTL store for inbound deduplication.
pub struct DedupCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Check if the key is new. Returns true if new (process it),
    /// false if duplicate (skip it). Records the key if new.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        // Existing non-expired entry means duplicate
        if let Some(&recorded_at) = entries.get(key) {
            if now.duration_since(recorded_at) < self.ttl {
                return false;
            }
        }

        // Evict expired entries first
        let cutoff = now - self.ttl;
        entries.retain(|_, &mut recorded_at| recorded_at > cutoff);

        // Evict oldest if at capacity
        if entries.len() >= self.max_entries {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, t)| *t)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }

        entries.insert(key.to_string(), now);
        true
    }

    /// Number of tracked entries (for testing/metrics).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    /// A store sized for typical webhook replay windows: 10-minute TTL,
    /// 10k entries.
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 10_000)
    }
}
