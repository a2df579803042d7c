//! AdmissionPipeline (component G) — orchestrates a single tool call
//! through rate limiting, plan ACL, dedup, reservation, invocation, and
//! settlement (spec.md §4.G).
//!
//! The explicit `CallState` progression and the "release on every exit
//! path" discipline are grounded on the teacher's `proxy/handler.rs`
//! request lifecycle (acquire upstream → proxy → record outcome, with a
//! `Drop`-adjacent cleanup guard on early return). Cancellation is
//! grounded on the teacher's use of `tokio_util::sync::CancellationToken`
//! for inflight-request teardown during shutdown.

use crate::dedup::{fingerprint, Deduplicator};
use crate::error::CoreError;
use crate::events::{Event, EventEmitter, Topic};
use crate::ledger::{CreditLedger, ReserveRequest};
use crate::metering::{MetricRecord, MetricsAggregator};
use crate::plan::PlanResolver;
use crate::ratelimit::RateLimiter;
use crate::session::SessionManager;
use crate::toolclient::ToolClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Init,
    RateOk,
    AclOk,
    DedupResolved,
    Reserved,
    Invoked,
    Settled,
    Denied,
    ErrorReserve,
    ErrorInvoke,
    Released,
    TimedOut,
}

pub struct CallRequest<'a> {
    pub key: &'a str,
    pub tool: &'a str,
    pub arguments: serde_json::Value,
    pub estimated_credits: f64,
    pub reservation_ttl_seconds: u64,
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub state: CallState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duplicate: bool,
    pub settled_credits: Option<f64>,
}

pub struct AdmissionPipeline {
    rate_limiter: Arc<RateLimiter>,
    plans: Arc<PlanResolver>,
    dedup: Arc<Deduplicator>,
    ledger: Arc<CreditLedger>,
    sessions: Arc<SessionManager>,
    metrics: Arc<MetricsAggregator>,
    tool_client: Arc<ToolClient>,
    events: Arc<EventEmitter>,
    rate_limit_config: crate::config::RateLimitConfig,
    hash_algorithm: crate::config::HashAlgorithm,
    clock: Arc<dyn crate::clock::Clock>,
}

impl AdmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        plans: Arc<PlanResolver>,
        dedup: Arc<Deduplicator>,
        ledger: Arc<CreditLedger>,
        sessions: Arc<SessionManager>,
        metrics: Arc<MetricsAggregator>,
        tool_client: Arc<ToolClient>,
        events: Arc<EventEmitter>,
        rate_limit_config: crate::config::RateLimitConfig,
        hash_algorithm: crate::config::HashAlgorithm,
        clock: Arc<dyn crate::clock::Clock>,
    ) -> Self {
        Self {
            rate_limiter,
            plans,
            dedup,
            ledger,
            sessions,
            metrics,
            tool_client,
            events,
            rate_limit_config,
            hash_algorithm,
            clock,
        }
    }

    /// Run one call through the full admission pipeline. `cancel` lets the
    /// caller abandon the downstream invocation (e.g. client disconnect);
    /// any reservation already held is released regardless of how the
    /// call exits.
    pub async fn admit(
        &self,
        req: CallRequest<'_>,
        cancel: CancellationToken,
    ) -> CallOutcome {
        let start = self.clock.now_ms();

        let decision = self.rate_limiter.check(req.key, &self.rate_limit_config);
        if !decision.allowed {
            self.events.emit(Event {
                topic: Topic::RateDenied,
                key: req.key.to_string(),
                tool: Some(req.tool.to_string()),
                amount: None,
                reason: Some("rate limit exceeded".to_string()),
            });
            return CallOutcome {
                state: CallState::Denied,
                result: None,
                error: Some(format!(
                    "rate limit exceeded, retry after {}ms",
                    decision.retry_after_ms
                )),
                duplicate: false,
                settled_credits: None,
            };
        }

        let acl = self.plans.is_tool_allowed_by_plan(req.key, req.tool);
        if !acl.allowed {
            return CallOutcome {
                state: CallState::Denied,
                result: None,
                error: acl.reason,
                duplicate: false,
                settled_credits: None,
            };
        }

        let fp = fingerprint(
            &serde_json::json!({"tool": req.tool, "args": req.arguments, "key": req.key}),
            self.hash_algorithm,
        );
        let dedup_check = self.dedup.check(&fp);
        if dedup_check.is_duplicate {
            return CallOutcome {
                state: CallState::DedupResolved,
                result: None,
                error: Some(format!(
                    "duplicate of a request first seen at {}ms, not re-invoked",
                    dedup_check.first_seen_at_ms.unwrap_or_default()
                )),
                duplicate: true,
                settled_credits: None,
            };
        }
        self.dedup.record(&fp, req.key, Some(req.tool));

        let multiplier = self.plans.get_credit_multiplier(req.key);
        let amount = req.estimated_credits * multiplier;

        let reserve_result = self.ledger.reserve(ReserveRequest {
            key: req.key,
            amount,
            tool: Some(req.tool),
            ttl_seconds: req.reservation_ttl_seconds,
            note: None,
        });
        if !reserve_result.success {
            return CallOutcome {
                state: CallState::ErrorReserve,
                result: None,
                error: reserve_result.error,
                duplicate: false,
                settled_credits: None,
            };
        }
        let reservation_id = reserve_result.id.expect("success implies an id");
        self.events.emit(Event {
            topic: Topic::ToolReserved,
            key: req.key.to_string(),
            tool: Some(req.tool.to_string()),
            amount: Some(amount),
            reason: None,
        });

        if cancel.is_cancelled() {
            self.ledger.release(reservation_id);
            return CallOutcome {
                state: CallState::Released,
                result: None,
                error: Some("cancelled before invocation".to_string()),
                duplicate: false,
                settled_credits: None,
            };
        }

        let invoke_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::transient("cancelled during invocation")),
            result = self.tool_client.invoke(req.tool, req.arguments.clone()) => result,
        };

        let (state, result, error, settled_credits) = match invoke_result {
            Ok(value) => {
                // CreditLedger::settle emits `tool.settled` itself.
                self.ledger.settle(reservation_id, Some(amount));
                (CallState::Settled, Some(value), None, Some(amount))
            }
            Err(e) => {
                self.ledger.release(reservation_id);
                self.events.emit(Event {
                    topic: Topic::ToolFailed,
                    key: req.key.to_string(),
                    tool: Some(req.tool.to_string()),
                    amount: None,
                    reason: Some(e.reason.clone()),
                });
                let state = if e.kind == crate::error::ErrorKind::Transient {
                    CallState::TimedOut
                } else {
                    CallState::ErrorInvoke
                };
                (state, None, Some(e.reason), None)
            }
        };

        if let Some(session_id) = req.session_id {
            self.sessions.record_call(
                session_id,
                req.tool,
                settled_credits.unwrap_or(0.0),
                state == CallState::Settled,
            );
        }

        let end = self.clock.now_ms();
        self.metrics.record(MetricRecord {
            timestamp_ms: end,
            latency_ms: (end - start).max(0) as u64,
            status_code: if state == CallState::Settled { 200 } else { 500 },
            tool: Some(req.tool.to_string()),
            key: Some(req.key.to_string()),
        });

        CallOutcome {
            state,
            result,
            error,
            duplicate: dedup_check.is_duplicate,
            settled_credits,
        }
    }
}
