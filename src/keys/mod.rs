//! KeyRegistry — the per-key record an external admin surface provisions
//! and the core consults for rate-limit/credit overrides and revocation.
//!
//! Grounded on the teacher's `ClusterStore`/`RoutingState` registries:
//! a `DashMap` keyed by name, mutated under the owning entry's lock, read
//! lock-free from the hot path.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// An opaque, process-wide-unique API key record (spec.md §3 "Key").
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: String,
    pub name: String,
    pub created_at_ms: i64,
    pub revoked: bool,
    pub plan: Option<String>,
    /// Per-key rate-limit override; `None` means "use the plan/global default".
    pub rate_limit_override: Option<u32>,
    /// Per-key credit-balance override applied only at creation time.
    pub credit_override: Option<f64>,
}

const MIN_KEY_LEN: usize = 8;
const MAX_KEY_LEN: usize = 128;

fn validate_key_format(key: &str) -> Result<(), String> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(format!(
            "key must be {MIN_KEY_LEN}-{MAX_KEY_LEN} bytes, got {}",
            key.len()
        ));
    }
    if !key.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err("key must be printable ASCII".to_string());
    }
    Ok(())
}

/// Registry of provisioned API keys.
pub struct KeyRegistry {
    keys: DashMap<String, KeyRecord>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Create a new key record. Fails validation if the key format is
    /// invalid or the key already exists.
    pub fn create(
        &self,
        key: &str,
        name: &str,
        now_ms: i64,
        rate_limit_override: Option<u32>,
        credit_override: Option<f64>,
    ) -> Result<KeyRecord, String> {
        validate_key_format(key)?;
        if self.keys.contains_key(key) {
            return Err(format!("key {key} already exists"));
        }
        let record = KeyRecord {
            key: key.to_string(),
            name: name.to_string(),
            created_at_ms: now_ms,
            revoked: false,
            plan: None,
            rate_limit_override,
            credit_override,
        };
        self.keys.insert(key.to_string(), record.clone());
        record_count_metric(self.keys.len());
        Ok(record)
    }

    pub fn get(&self, key: &str) -> Option<KeyRecord> {
        self.keys.get(key).map(|r| r.value().clone())
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.keys.get(key).map(|r| !r.revoked).unwrap_or(false)
    }

    pub fn revoke(&self, key: &str) -> bool {
        match self.keys.get_mut(key) {
            Some(mut r) => {
                r.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Assign (or clear, with `plan = None`) the plan a key resolves to.
    /// Validation that the plan exists is the caller's (PlanResolver's)
    /// responsibility.
    pub fn set_plan(&self, key: &str, plan: Option<String>) -> bool {
        match self.keys.get_mut(key) {
            Some(mut r) => {
                r.plan = plan;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<KeyRecord> {
        self.keys.iter().map(|r| r.value().clone()).collect()
    }

    pub fn count_referencing_plan(&self, plan: &str) -> usize {
        self.keys
            .iter()
            .filter(|r| r.plan.as_deref() == Some(plan))
            .count()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

static KEY_COUNT: AtomicI64 = AtomicI64::new(0);

fn record_count_metric(n: usize) {
    KEY_COUNT.store(n as i64, Ordering::Relaxed);
    metrics::gauge!("creditgate_keys_total").set(n as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let reg = KeyRegistry::new();
        let rec = reg.create("abcdefgh12345678", "alice", 1000, None, None).unwrap();
        assert_eq!(rec.key, "abcdefgh12345678");
        assert!(reg.is_active("abcdefgh12345678"));
    }

    #[test]
    fn rejects_short_key() {
        let reg = KeyRegistry::new();
        assert!(reg.create("short", "x", 0, None, None).is_err());
    }

    #[test]
    fn rejects_duplicate() {
        let reg = KeyRegistry::new();
        reg.create("abcdefgh12345678", "a", 0, None, None).unwrap();
        assert!(reg.create("abcdefgh12345678", "b", 0, None, None).is_err());
    }

    #[test]
    fn revoke_marks_inactive() {
        let reg = KeyRegistry::new();
        reg.create("abcdefgh12345678", "a", 0, None, None).unwrap();
        assert!(reg.revoke("abcdefgh12345678"));
        assert!(!reg.is_active("abcdefgh12345678"));
    }

    #[test]
    fn revoke_unknown_returns_false() {
        let reg = KeyRegistry::new();
        assert!(!reg.revoke("nope"));
    }

    #[test]
    fn count_referencing_plan() {
        let reg = KeyRegistry::new();
        reg.create("abcdefgh12345678", "a", 0, None, None).unwrap();
        reg.create("ijklmnop12345678", "b", 0, None, None).unwrap();
        reg.set_plan("abcdefgh12345678", Some("free".to_string()));
        reg.set_plan("ijklmnop12345678", Some("free".to_string()));
        assert_eq!(reg.count_referencing_plan("free"), 2);
        reg.set_plan("abcdefgh12345678", None);
        assert_eq!(reg.count_referencing_plan("free"), 1);
    }
}
