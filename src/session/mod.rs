//! SessionManager (component E) — tracks a bounded-lifetime grouping of
//! calls made under one key.
//!
//! Grounded on the teacher's `ClusterStore` per-entry-lock discipline
//! (`upstream/cluster.rs`): one `Mutex` per session for call recording,
//! plus a coarse per-key index (`DashMap<String, Vec<String>>`) so
//! `get_key_report` doesn't need to scan every session (spec.md §5).

use crate::clock::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
    Expired,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub tool: String,
    pub credits: f64,
    pub at_ms: i64,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub key: String,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub expires_at_ms: i64,
    pub total_calls: u64,
    pub total_credits: f64,
    pub calls: Vec<CallRecord>,
}

#[derive(Debug, Clone)]
pub struct ToolCreditBreakdown {
    pub tool: String,
    pub calls: u64,
    pub credits: f64,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: String,
    pub key: String,
    pub status: SessionStatus,
    pub total_calls: u64,
    pub total_credits: f64,
    /// Grouped by tool, sorted by descending credits.
    pub by_tool: Vec<ToolCreditBreakdown>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyReport {
    pub active_sessions: u64,
    pub ended_sessions: u64,
    pub expired_sessions: u64,
    pub total_calls: u64,
    pub total_credits: f64,
}

struct SessionEntry {
    session: Mutex<Session>,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionEntry>>,
    by_key: DashMap<String, Vec<String>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    default_ttl_ms: i64,
    max_active_sessions: usize,
}

fn format_session_id(id: u64) -> String {
    format!("sess_{id}")
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, default_ttl_ms: u64, max_active_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            by_key: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock,
            default_ttl_ms: default_ttl_ms as i64,
            max_active_sessions,
        }
    }

    /// Lazily flip an `Active` session to `Expired` if past its deadline.
    /// Takes the session lock; caller must not already hold it.
    fn refresh_status(&self, entry: &SessionEntry) {
        let now = self.clock.now_ms();
        let mut session = entry.session.lock().unwrap();
        if session.status == SessionStatus::Active && session.expires_at_ms <= now {
            session.status = SessionStatus::Expired;
            metrics::gauge!("creditgate_sessions_active").decrement(1.0);
        }
    }

    pub fn create_session(&self, key: &str, ttl_ms: Option<u64>) -> Result<Session, String> {
        let active_count = self
            .by_key
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.is_active_id(id))
                    .count()
            })
            .unwrap_or(0);
        if active_count >= self.max_active_sessions {
            return Err(format!(
                "key {key} has reached the active session limit ({})",
                self.max_active_sessions
            ));
        }

        let now = self.clock.now_ms();
        let id = format_session_id(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ttl = ttl_ms.map(|v| v as i64).unwrap_or(self.default_ttl_ms);
        let session = Session {
            id: id.clone(),
            key: key.to_string(),
            status: SessionStatus::Active,
            created_at_ms: now,
            ended_at_ms: None,
            expires_at_ms: now + ttl,
            total_calls: 0,
            total_credits: 0.0,
            calls: Vec::new(),
        };

        self.sessions.insert(
            id.clone(),
            Arc::new(SessionEntry {
                session: Mutex::new(session.clone()),
            }),
        );
        self.by_key.entry(key.to_string()).or_default().push(id);
        metrics::gauge!("creditgate_sessions_active").increment(1.0);

        Ok(session)
    }

    fn is_active_id(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                self.refresh_status(entry.value());
                entry.value().session.lock().unwrap().status == SessionStatus::Active
            }
            None => false,
        }
    }

    pub fn end_session(&self, id: &str) -> bool {
        let Some(entry) = self.sessions.get(id) else {
            return false;
        };
        self.refresh_status(entry.value());
        let mut session = entry.value().session.lock().unwrap();
        if session.status != SessionStatus::Active {
            return false;
        }
        session.status = SessionStatus::Ended;
        session.ended_at_ms = Some(self.clock.now_ms());
        metrics::gauge!("creditgate_sessions_active").decrement(1.0);
        true
    }

    pub fn record_call(&self, id: &str, tool: &str, credits: f64, success: bool) -> bool {
        let Some(entry) = self.sessions.get(id) else {
            return false;
        };
        self.refresh_status(entry.value());
        let mut session = entry.value().session.lock().unwrap();
        if session.status != SessionStatus::Active {
            return false;
        }
        session.total_calls += 1;
        session.total_credits += credits;
        session.calls.push(CallRecord {
            tool: tool.to_string(),
            credits,
            at_ms: self.clock.now_ms(),
            success,
        });
        true
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        let entry = self.sessions.get(id)?;
        self.refresh_status(entry.value());
        Some(entry.value().session.lock().unwrap().clone())
    }

    pub fn get_session_report(&self, id: &str) -> Option<SessionReport> {
        let session = self.get_session(id)?;

        let mut by_tool: Vec<ToolCreditBreakdown> = Vec::new();
        for call in &session.calls {
            match by_tool.iter_mut().find(|b| b.tool == call.tool) {
                Some(b) => {
                    b.calls += 1;
                    b.credits += call.credits;
                }
                None => by_tool.push(ToolCreditBreakdown {
                    tool: call.tool.clone(),
                    calls: 1,
                    credits: call.credits,
                }),
            }
        }
        by_tool.sort_by(|a, b| b.credits.total_cmp(&a.credits));

        Some(SessionReport {
            id: session.id,
            key: session.key,
            status: session.status,
            total_calls: session.total_calls,
            total_credits: session.total_credits,
            by_tool,
        })
    }

    pub fn get_key_report(&self, key: &str) -> KeyReport {
        let mut report = KeyReport::default();
        let Some(ids) = self.by_key.get(key) else {
            return report;
        };
        for id in ids.iter() {
            let Some(session) = self.get_session(id) else {
                continue;
            };
            match session.status {
                SessionStatus::Active => report.active_sessions += 1,
                SessionStatus::Ended => report.ended_sessions += 1,
                SessionStatus::Expired => report.expired_sessions += 1,
            }
            report.total_calls += session.total_calls;
            report.total_credits += session.total_credits;
        }
        report
    }

    /// Drop ended/expired sessions whose `ended_at_ms`/`expires_at_ms` is
    /// older than `now - age_ms`. Active sessions are never removed.
    pub fn cleanup(&self, age_ms: i64) -> usize {
        let now = self.clock.now_ms();
        for entry in self.sessions.iter() {
            self.refresh_status(entry.value());
        }
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                let session = e.value().session.lock().unwrap();
                match session.status {
                    SessionStatus::Ended => {
                        session.ended_at_ms.is_some_and(|t| t < now - age_ms)
                    }
                    SessionStatus::Expired => session.expires_at_ms < now - age_ms,
                    SessionStatus::Active => false,
                }
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            self.sessions.remove(id);
        }
        for mut ids in self.by_key.iter_mut() {
            ids.retain(|id| !stale.contains(id));
        }
        stale.len()
    }

    pub fn destroy(&self) {
        self.sessions.clear();
        self.by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn manager() -> (Arc<TestClock>, SessionManager) {
        let clock = Arc::new(TestClock::new(0));
        let mgr = SessionManager::new(clock.clone(), 3_600_000, 10);
        (clock, mgr)
    }

    #[test]
    fn create_record_end_roundtrip() {
        let (_clock, mgr) = manager();
        let session = mgr.create_session("key1", None).unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        assert!(mgr.record_call(&session.id, "search", 1.5, true));
        let report = mgr.get_session_report(&session.id).unwrap();
        assert_eq!(report.total_calls, 1);
        assert_eq!(report.total_credits, 1.5);

        assert!(mgr.end_session(&session.id));
        assert!(!mgr.end_session(&session.id), "double end returns false");
        assert!(!mgr.record_call(&session.id, "search", 1.0, true));
    }

    #[test]
    fn session_expires_lazily() {
        let (clock, mgr) = manager();
        let session = mgr.create_session("key1", Some(1000)).unwrap();
        clock.advance_ms(1500);
        let got = mgr.get_session(&session.id).unwrap();
        assert_eq!(got.status, SessionStatus::Expired);
        assert!(!mgr.record_call(&session.id, "search", 1.0, true));
    }

    #[test]
    fn active_session_cap_enforced() {
        let clock = Arc::new(TestClock::new(0));
        let mgr = SessionManager::new(clock, 3_600_000, 2);
        mgr.create_session("key1", None).unwrap();
        mgr.create_session("key1", None).unwrap();
        assert!(mgr.create_session("key1", None).is_err());
    }

    #[test]
    fn key_report_aggregates_across_sessions() {
        let (_clock, mgr) = manager();
        let s1 = mgr.create_session("key1", None).unwrap();
        let s2 = mgr.create_session("key1", None).unwrap();
        mgr.record_call(&s1.id, "a", 2.0, true);
        mgr.record_call(&s2.id, "b", 3.0, true);
        mgr.end_session(&s2.id);

        let report = mgr.get_key_report("key1");
        assert_eq!(report.active_sessions, 1);
        assert_eq!(report.ended_sessions, 1);
        assert_eq!(report.total_calls, 2);
        assert_eq!(report.total_credits, 5.0);
    }

    #[test]
    fn cleanup_removes_stale_sessions() {
        let (clock, mgr) = manager();
        let session = mgr.create_session("key1", None).unwrap();
        mgr.end_session(&session.id);
        clock.advance_ms(10_000);
        assert_eq!(mgr.cleanup(5_000), 1);
        assert!(mgr.get_session(&session.id).is_none());
    }

    #[test]
    fn cleanup_spares_active_sessions_regardless_of_age() {
        let (clock, mgr) = manager();
        let session = mgr.create_session("key1", Some(3_600_000_000)).unwrap();
        clock.advance_ms(10_000);
        assert_eq!(mgr.cleanup(5_000), 0);
        assert!(mgr.get_session(&session.id).is_some());
    }

    #[test]
    fn session_report_groups_by_tool_descending_credits() {
        let (_clock, mgr) = manager();
        let session = mgr.create_session("key1", None).unwrap();
        mgr.record_call(&session.id, "search", 1.0, true);
        mgr.record_call(&session.id, "fetch", 5.0, true);
        mgr.record_call(&session.id, "search", 2.0, true);

        let report = mgr.get_session_report(&session.id).unwrap();
        assert_eq!(report.by_tool.len(), 2);
        assert_eq!(report.by_tool[0].tool, "fetch");
        assert_eq!(report.by_tool[0].credits, 5.0);
        assert_eq!(report.by_tool[1].tool, "search");
        assert_eq!(report.by_tool[1].calls, 2);
        assert_eq!(report.by_tool[1].credits, 3.0);
    }
}
