//! Deduplicator (component B) — content-addressed idempotency cache.
//!
//! Fingerprinting is new code (the teacher has no request-hashing of its
//! own): canonical JSON is produced by recursively sorting object keys,
//! then digested with either a cheap `fast` hash (`std`'s deterministic
//! `DefaultHasher`, SipHash with fixed keys) or a `detailed` cryptographic
//! hash (`sha2::Sha256`, truncated to 128 bits) per spec.md §3/§4.B.
//!
//! Capacity/TTL eviction follows the teacher's per-component single-lock
//! idiom (spec.md §5: "reads vastly outnumber writes").

use crate::clock::Clock;
use crate::config::{DedupConfig, HashAlgorithm};
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct FingerprintRecord {
    pub fp: String,
    pub first_seen_at_ms: i64,
    pub last_seen_at_ms: i64,
    pub count: u64,
    pub key: String,
    pub tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupCheck {
    pub is_duplicate: bool,
    pub previous_count: u64,
    pub first_seen_at_ms: Option<i64>,
}

/// Canonicalize a JSON value: recursively sort object keys, then serialize
/// compactly. `serde_json::Value::Object` is backed by a `BTreeMap`-like
/// ordering only when the `preserve_order` feature is off — we sort
/// explicitly here so the guarantee holds regardless of feature flags.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Compute the stable fingerprint of a request payload.
pub fn fingerprint(payload: &serde_json::Value, algorithm: HashAlgorithm) -> String {
    let canonical = canonicalize(payload);
    let compact = serde_json::to_string(&canonical).unwrap_or_default();

    match algorithm {
        HashAlgorithm::Fast => {
            let mut hasher = DefaultHasher::new();
            compact.hash(&mut hasher);
            format!("fp_{:08x}", hasher.finish() as u32)
        }
        HashAlgorithm::Detailed => {
            let mut hasher = Sha256::new();
            hasher.update(compact.as_bytes());
            let digest = hasher.finalize();
            let mut hex = String::with_capacity(32);
            for byte in &digest[..16] {
                hex.push_str(&format!("{byte:02x}"));
            }
            format!("fpd_{hex}")
        }
    }
}

struct Store {
    records: HashMap<String, FingerprintRecord>,
}

pub struct Deduplicator {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(clock: Arc<dyn Clock>, config: DedupConfig) -> Self {
        Self {
            store: Mutex::new(Store {
                records: HashMap::new(),
            }),
            clock,
            config,
        }
    }

    fn is_expired(&self, record: &FingerprintRecord, now: i64) -> bool {
        record.last_seen_at_ms + self.config.ttl_ms as i64 < now
    }

    /// Check whether `fp` refers to a non-expired prior record.
    pub fn check(&self, fp: &str) -> DedupCheck {
        let now = self.clock.now_ms();
        let store = self.store.lock().unwrap();
        match store.records.get(fp) {
            Some(record) if !self.is_expired(record, now) => {
                metrics::counter!("creditgate_dedup_hits_total").increment(1);
                DedupCheck {
                    is_duplicate: true,
                    previous_count: record.count,
                    first_seen_at_ms: Some(record.first_seen_at_ms),
                }
            }
            _ => DedupCheck {
                is_duplicate: false,
                previous_count: 0,
                first_seen_at_ms: None,
            },
        }
    }

    /// Insert or refresh a fingerprint record. Returns the new count.
    pub fn record(&self, fp: &str, key: &str, tool: Option<&str>) -> u64 {
        let now = self.clock.now_ms();
        let mut store = self.store.lock().unwrap();

        if let Some(record) = store.records.get_mut(fp) {
            let expired = record.last_seen_at_ms + self.config.ttl_ms as i64 < now;
            if expired {
                record.first_seen_at_ms = now;
                record.count = 1;
            } else {
                record.count += 1;
            }
            record.last_seen_at_ms = now;
            record.key = key.to_string();
            record.tool = tool.map(|s| s.to_string());
            return record.count;
        }

        if store.records.len() >= self.config.max_entries {
            evict_oldest(&mut store.records);
        }

        store.records.insert(
            fp.to_string(),
            FingerprintRecord {
                fp: fp.to_string(),
                first_seen_at_ms: now,
                last_seen_at_ms: now,
                count: 1,
                key: key.to_string(),
                tool: tool.map(|s| s.to_string()),
            },
        );
        1
    }

    pub fn destroy(&self) {
        self.store.lock().unwrap().records.clear();
    }
}

/// Evict the entry with the smallest `last_seen_at_ms` (FIFO on access).
fn evict_oldest(records: &mut HashMap<String, FingerprintRecord>) {
    if let Some(victim) = records
        .values()
        .min_by_key(|r| r.last_seen_at_ms)
        .map(|r| r.fp.clone())
    {
        records.remove(&victim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn dedup_config(ttl_ms: u64, max_entries: usize) -> DedupConfig {
        DedupConfig {
            ttl_ms,
            max_entries,
            hash_algorithm: HashAlgorithm::Fast,
        }
    }

    #[test]
    fn fingerprint_is_invariant_under_key_order() {
        let a = serde_json::json!({"tool": "search", "args": {"q": "x", "n": 1}});
        let b = serde_json::json!({"args": {"n": 1, "q": "x"}, "tool": "search"});
        assert_eq!(
            fingerprint(&a, HashAlgorithm::Fast),
            fingerprint(&b, HashAlgorithm::Fast)
        );
        assert_eq!(
            fingerprint(&a, HashAlgorithm::Detailed),
            fingerprint(&b, HashAlgorithm::Detailed)
        );
    }

    #[test]
    fn fingerprint_changes_with_scalar() {
        let a = serde_json::json!({"tool": "search", "q": "x"});
        let b = serde_json::json!({"tool": "search", "q": "y"});
        assert_ne!(
            fingerprint(&a, HashAlgorithm::Fast),
            fingerprint(&b, HashAlgorithm::Fast)
        );
    }

    #[test]
    fn prefixes_match_algorithm() {
        let v = serde_json::json!({"a": 1});
        assert!(fingerprint(&v, HashAlgorithm::Fast).starts_with("fp_"));
        assert!(fingerprint(&v, HashAlgorithm::Detailed).starts_with("fpd_"));
    }

    #[test]
    fn record_then_check_is_duplicate() {
        let clock = Arc::new(TestClock::new(0));
        let dedup = Deduplicator::new(clock, dedup_config(1000, 10));
        assert!(!dedup.check("fp_x").is_duplicate);
        assert_eq!(dedup.record("fp_x", "key1", Some("search")), 1);
        let check = dedup.check("fp_x");
        assert!(check.is_duplicate);
        assert_eq!(check.previous_count, 1);
        assert_eq!(dedup.record("fp_x", "key1", Some("search")), 2);
    }

    #[test]
    fn dedup_expire_scenario_from_spec() {
        // spec.md §8 scenario 5.
        let clock = Arc::new(TestClock::new(0));
        let dedup = Deduplicator::new(clock.clone(), dedup_config(200, 10));
        dedup.record("fp_x", "key1", None);
        assert!(dedup.check("fp_x").is_duplicate);
        clock.advance_ms(250);
        assert!(!dedup.check("fp_x").is_duplicate);
    }

    #[test]
    fn eviction_at_capacity_removes_oldest() {
        let clock = Arc::new(TestClock::new(0));
        let dedup = Deduplicator::new(clock.clone(), dedup_config(100_000, 2));
        dedup.record("fp_a", "k", None);
        clock.advance_ms(10);
        dedup.record("fp_b", "k", None);
        clock.advance_ms(10);
        // fp_a is the oldest by last_seen; inserting a third entry evicts it.
        dedup.record("fp_c", "k", None);
        assert!(!dedup.check("fp_a").is_duplicate);
        assert!(dedup.check("fp_b").is_duplicate);
        assert!(dedup.check("fp_c").is_duplicate);
    }
}
