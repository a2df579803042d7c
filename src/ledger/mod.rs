//! CreditLedger (component C) — per-key balances with a two-phase
//! reserve → settle|release|expire workflow.
//!
//! Per-key locking is grounded on the teacher's `CircuitBreakerRegistry`
//! (`upstream/circuit_breaker.rs`): a `DashMap<String, Arc<Mutex<..>>>`
//! with a fast-path `get` before the allocating `entry().or_insert_with`.
//! The auto-expire ticker is grounded on the teacher's
//! `RateLimiter::start_gc` — a detached `tokio::spawn` + `tokio::time::interval`
//! loop that never blocks process shutdown.

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::events::{Event, EventEmitter, Topic};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Held,
    Settled,
    Released,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: u64,
    pub key: String,
    pub amount: f64,
    pub status: ReservationStatus,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub settled_amount: Option<f64>,
    pub settled_at_ms: Option<i64>,
    pub released_at_ms: Option<i64>,
    pub tool: Option<String>,
    pub note: Option<String>,
}

pub struct ReserveRequest<'a> {
    pub key: &'a str,
    pub amount: f64,
    pub tool: Option<&'a str>,
    pub ttl_seconds: u64,
    pub note: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ReserveResult {
    pub id: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub available_balance: f64,
    pub held_balance: f64,
}

/// Format a reservation id as the `res_<n>` string used in spec.md's
/// literal scenarios.
pub fn format_reservation_id(id: u64) -> String {
    format!("res_{id}")
}

struct KeyLedger {
    balance: f64,
    held_sum: f64,
    held_count: usize,
    reservations: HashMap<u64, Reservation>,
}

impl KeyLedger {
    fn new() -> Self {
        Self {
            balance: 0.0,
            held_sum: 0.0,
            held_count: 0,
            reservations: HashMap::new(),
        }
    }

    fn available(&self) -> f64 {
        self.balance - self.held_sum
    }
}

pub struct CreditLedger {
    ledgers: DashMap<String, Mutex<KeyLedger>>,
    id_index: DashMap<u64, String>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    events: Option<Arc<EventEmitter>>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CreditLedger {
    pub fn new(clock: Arc<dyn Clock>, config: LedgerConfig, events: Option<Arc<EventEmitter>>) -> Self {
        Self {
            ledgers: DashMap::new(),
            id_index: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock,
            config,
            events,
            ticker: Mutex::new(None),
        }
    }

    fn get_or_create(&self, key: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<KeyLedger>> {
        if !self.ledgers.contains_key(key) {
            self.ledgers
                .entry(key.to_string())
                .or_insert_with(|| Mutex::new(KeyLedger::new()));
        }
        self.ledgers.get(key).unwrap()
    }

    /// Unconditional balance assignment.
    pub fn set_balance(&self, key: &str, amount: f64) {
        let entry = self.get_or_create(key);
        let mut ledger = entry.value().lock().unwrap();
        ledger.balance = amount;
    }

    pub fn get_balance(&self, key: &str) -> f64 {
        match self.ledgers.get(key) {
            Some(entry) => entry.value().lock().unwrap().balance,
            None => 0.0,
        }
    }

    pub fn get_available(&self, key: &str) -> f64 {
        match self.ledgers.get(key) {
            Some(entry) => entry.value().lock().unwrap().available(),
            None => 0.0,
        }
    }

    pub fn reserve(&self, req: ReserveRequest<'_>) -> ReserveResult {
        if req.amount <= 0.0 {
            return self.reject(req.key, "amount must be positive");
        }
        if let Some(max) = self.config.max_reservation_amount {
            if req.amount > max {
                return self.reject(req.key, "amount exceeds maxReservationAmount");
            }
        }

        let entry = self.get_or_create(req.key);
        let mut ledger = entry.value().lock().unwrap();

        if ledger.held_count >= self.config.max_reservations_per_key {
            drop(ledger);
            return self.reject(req.key, "maxReservationsPerKey exceeded");
        }

        if ledger.available() < req.amount {
            let available = ledger.available();
            let held = ledger.held_sum;
            drop(ledger);
            return ReserveResult {
                id: None,
                success: false,
                error: Some("insufficient available balance".to_string()),
                available_balance: available,
                held_balance: held,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_ms();
        let reservation = Reservation {
            id,
            key: req.key.to_string(),
            amount: req.amount,
            status: ReservationStatus::Held,
            created_at_ms: now,
            expires_at_ms: now + req.ttl_seconds as i64 * 1000,
            settled_amount: None,
            settled_at_ms: None,
            released_at_ms: None,
            tool: req.tool.map(|s| s.to_string()),
            note: req.note.map(|s| s.to_string()),
        };
        ledger.reservations.insert(id, reservation);
        ledger.held_count += 1;
        ledger.held_sum += req.amount;

        let available_balance = ledger.available();
        let held_balance = ledger.held_sum;
        drop(ledger);

        self.id_index.insert(id, req.key.to_string());
        metrics::counter!("creditgate_reservations_total", "outcome" => "held").increment(1);

        ReserveResult {
            id: Some(id),
            success: true,
            error: None,
            available_balance,
            held_balance,
        }
    }

    fn reject(&self, key: &str, reason: &str) -> ReserveResult {
        let (available_balance, held_balance) = match self.ledgers.get(key) {
            Some(entry) => {
                let l = entry.value().lock().unwrap();
                (l.available(), l.held_sum)
            }
            None => (0.0, 0.0),
        };
        metrics::counter!("creditgate_reservations_total", "outcome" => "rejected").increment(1);
        ReserveResult {
            id: None,
            success: false,
            error: Some(reason.to_string()),
            available_balance,
            held_balance,
        }
    }

    /// `actual_amount` defaults to the reserved amount. Only transitions
    /// from `Held`; no-op (returns `false`) otherwise, including for an
    /// unknown id or a negative `actual_amount`.
    pub fn settle(&self, id: u64, actual_amount: Option<f64>) -> bool {
        let Some(key) = self.id_index.get(&id).map(|r| r.value().clone()) else {
            return false;
        };
        let Some(entry) = self.ledgers.get(&key) else {
            return false;
        };
        let mut ledger = entry.value().lock().unwrap();
        let Some(reservation) = ledger.reservations.get(&id) else {
            return false;
        };
        if reservation.status != ReservationStatus::Held {
            return false;
        }
        let actual = actual_amount.unwrap_or(reservation.amount);
        if actual < 0.0 {
            return false;
        }

        let reserved_amount = reservation.amount;
        let now = self.clock.now_ms();
        if let Some(r) = ledger.reservations.get_mut(&id) {
            r.status = ReservationStatus::Settled;
            r.settled_amount = Some(actual);
            r.settled_at_ms = Some(now);
        }
        ledger.held_count -= 1;
        ledger.held_sum -= reserved_amount;
        // Settlement deducts the actual amount even if it drives the
        // balance below zero — the hold is honoured (spec.md §4.C).
        ledger.balance -= actual;
        drop(ledger);

        metrics::counter!("creditgate_reservations_total", "outcome" => "settled").increment(1);
        self.emit(Topic::ToolSettled, &key, actual);
        true
    }

    /// Return the reserved amount to the available pool without touching
    /// balance. Only transitions from `Held`; double-release returns `false`.
    pub fn release(&self, id: u64) -> bool {
        let Some(key) = self.id_index.get(&id).map(|r| r.value().clone()) else {
            return false;
        };
        let Some(entry) = self.ledgers.get(&key) else {
            return false;
        };
        let mut ledger = entry.value().lock().unwrap();
        let Some(reservation) = ledger.reservations.get(&id) else {
            return false;
        };
        if reservation.status != ReservationStatus::Held {
            return false;
        }
        let amount = reservation.amount;
        let now = self.clock.now_ms();
        if let Some(r) = ledger.reservations.get_mut(&id) {
            r.status = ReservationStatus::Released;
            r.released_at_ms = Some(now);
        }
        ledger.held_count -= 1;
        ledger.held_sum -= amount;
        drop(ledger);

        metrics::counter!("creditgate_reservations_total", "outcome" => "released").increment(1);
        true
    }

    /// Scan all keys and transition `Held` reservations past their
    /// `expires_at_ms` to `Expired`. Returns the number transitioned.
    pub fn expire_reservations(&self) -> usize {
        let now = self.clock.now_ms();
        let mut expired_count = 0;
        let mut expired_keys: Vec<String> = Vec::new();

        for entry in self.ledgers.iter() {
            let mut ledger = entry.value().lock().unwrap();
            let due: Vec<(u64, f64)> = ledger
                .reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Held && r.expires_at_ms <= now)
                .map(|r| (r.id, r.amount))
                .collect();

            for (id, amount) in due {
                if let Some(r) = ledger.reservations.get_mut(&id) {
                    r.status = ReservationStatus::Expired;
                }
                ledger.held_count -= 1;
                ledger.held_sum -= amount;
                expired_count += 1;
                expired_keys.push(entry.key().clone());
            }
        }

        if expired_count > 0 {
            metrics::counter!("creditgate_reservations_total", "outcome" => "expired")
                .increment(expired_count as u64);
            for key in expired_keys {
                self.emit(Topic::ReservationExpired, &key, 0.0);
            }
        }
        expired_count
    }

    pub fn get_reservation(&self, id: u64) -> Option<Reservation> {
        let key = self.id_index.get(&id)?.value().clone();
        let entry = self.ledgers.get(&key)?;
        entry.value().lock().unwrap().reservations.get(&id).cloned()
    }

    fn emit(&self, topic: Topic, key: &str, amount: f64) {
        if let Some(events) = &self.events {
            events.emit(Event {
                topic,
                key: key.to_string(),
                tool: None,
                amount: Some(amount),
                reason: None,
            });
        }
    }

    /// Spawn the background auto-expire ticker. Must not prevent process
    /// shutdown — the handle is retained so `destroy()` can abort it.
    pub fn start_auto_expire_ticker(self: &Arc<Self>) {
        let ledger = Arc::clone(self);
        let interval_ms = self.config.auto_expire_interval_ms.max(1);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                let n = ledger.expire_reservations();
                if n > 0 {
                    tracing::debug!("ledger: auto-expire: transitioned, count={}", n);
                }
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    pub fn destroy(&self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
        self.ledgers.clear();
        self.id_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn ledger(config: LedgerConfig) -> CreditLedger {
        CreditLedger::new(Arc::new(TestClock::new(0)), config, None)
    }

    fn default_config() -> LedgerConfig {
        LedgerConfig {
            default_ttl_seconds: 300,
            max_reservations_per_key: 50,
            max_reservation_amount: None,
            auto_expire_interval_ms: 30_000,
        }
    }

    #[test]
    fn reserve_then_settle_scenario_from_spec() {
        // spec.md §8 scenario 2.
        let l = ledger(default_config());
        l.set_balance("a", 1000.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 50.0,
            tool: Some("g"),
            ttl_seconds: 300,
            note: None,
        });
        assert!(res.success);
        assert_eq!(res.available_balance, 950.0);
        assert_eq!(res.held_balance, 50.0);

        let id = res.id.unwrap();
        assert!(l.settle(id, Some(35.0)));
        assert_eq!(l.get_balance("a"), 965.0);
        assert_eq!(l.get_available("a"), 965.0);
    }

    #[test]
    fn reserve_then_release_scenario_from_spec() {
        // spec.md §8 scenario 3.
        let l = ledger(default_config());
        l.set_balance("a", 1000.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 50.0,
            tool: Some("g"),
            ttl_seconds: 300,
            note: None,
        });
        let id = res.id.unwrap();
        assert!(l.release(id));
        assert_eq!(l.get_balance("a"), 1000.0);
        assert_eq!(l.get_available("a"), 1000.0);
        // Double-release returns false.
        assert!(!l.release(id));
    }

    #[test]
    fn expiration_scenario_from_spec() {
        // spec.md §8 scenario 4.
        let clock = Arc::new(TestClock::new(0));
        let l = CreditLedger::new(clock.clone(), default_config(), None);
        l.set_balance("a", 100.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 10.0,
            tool: None,
            ttl_seconds: 1,
            note: None,
        });
        assert!(res.success);
        clock.advance_ms(1200);
        assert_eq!(l.expire_reservations(), 1);
        let reservation = l.get_reservation(res.id.unwrap()).unwrap();
        assert_eq!(reservation.status, ReservationStatus::Expired);
        // Expiry does not touch balance.
        assert_eq!(l.get_balance("a"), 100.0);
        assert_eq!(l.get_available("a"), 100.0);
    }

    #[test]
    fn reserve_rejects_non_positive_amount() {
        let l = ledger(default_config());
        l.set_balance("a", 100.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 0.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(!res.success);
    }

    #[test]
    fn reserve_rejects_over_max_amount() {
        let mut cfg = default_config();
        cfg.max_reservation_amount = Some(10.0);
        let l = ledger(cfg);
        l.set_balance("a", 1000.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 11.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(!res.success);
    }

    #[test]
    fn reserve_rejects_insufficient_available() {
        let l = ledger(default_config());
        l.set_balance("a", 10.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 11.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(!res.success);
    }

    #[test]
    fn reservation_cap_enforced() {
        let mut cfg = default_config();
        cfg.max_reservations_per_key = 2;
        let l = ledger(cfg);
        l.set_balance("a", 1000.0);
        for _ in 0..2 {
            let res = l.reserve(ReserveRequest {
                key: "a",
                amount: 1.0,
                tool: None,
                ttl_seconds: 60,
                note: None,
            });
            assert!(res.success);
        }
        let third = l.reserve(ReserveRequest {
            key: "a",
            amount: 1.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(!third.success);
    }

    #[test]
    fn settle_defaults_to_reserved_amount() {
        let l = ledger(default_config());
        l.set_balance("a", 100.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 20.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(l.settle(res.id.unwrap(), None));
        assert_eq!(l.get_balance("a"), 80.0);
    }

    #[test]
    fn settle_rejects_negative_actual_amount() {
        let l = ledger(default_config());
        l.set_balance("a", 100.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 20.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        assert!(!l.settle(res.id.unwrap(), Some(-1.0)));
    }

    #[test]
    fn settle_can_overdraw_balance() {
        // Settlement honours the hold even if the balance was concurrently
        // reduced below the settled amount (spec.md §4.C, deliberate).
        let l = ledger(default_config());
        l.set_balance("a", 100.0);
        let res = l.reserve(ReserveRequest {
            key: "a",
            amount: 20.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        l.set_balance("a", 5.0);
        assert!(l.settle(res.id.unwrap(), Some(20.0)));
        assert_eq!(l.get_balance("a"), -15.0);
    }

    #[test]
    fn conservation_invariant_holds_across_mixed_outcomes() {
        // Invariant 1: balance(t) + sum(held) = balance(0) + adds - settledAmount.
        let l = ledger(default_config());
        l.set_balance("a", 500.0);
        let r1 = l.reserve(ReserveRequest {
            key: "a",
            amount: 100.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        let r2 = l.reserve(ReserveRequest {
            key: "a",
            amount: 50.0,
            tool: None,
            ttl_seconds: 60,
            note: None,
        });
        l.settle(r1.id.unwrap(), Some(90.0));
        l.release(r2.id.unwrap());

        assert_eq!(l.get_balance("a"), 410.0);
        assert_eq!(l.get_available("a"), 410.0); // nothing held anymore
    }
}
