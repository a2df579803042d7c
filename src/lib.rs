pub mod admin;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod keys;
pub mod ledger;
pub mod metering;
pub mod pipeline;
pub mod plan;
pub mod ratelimit;
pub mod runtime;
pub mod session;
pub mod telemetry;
pub mod toolclient;

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::dedup::Deduplicator;
use crate::events::EventEmitter;
use crate::keys::KeyRegistry;
use crate::ledger::CreditLedger;
use crate::metering::MetricsAggregator;
use crate::pipeline::AdmissionPipeline;
use crate::plan::PlanResolver;
use crate::ratelimit::RateLimiter;
use crate::session::SessionManager;
use crate::toolclient::ToolClient;
use std::sync::Arc;

/// One cheap-to-clone handle bundling every component, threaded through
/// the admission pipeline and the admin listener (spec.md §5).
#[derive(Clone)]
pub struct CoreServices {
    pub config: Arc<CoreConfig>,
    pub clock: Arc<dyn Clock>,
    pub keys: Arc<KeyRegistry>,
    pub events: Arc<EventEmitter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub plans: Arc<PlanResolver>,
    pub dedup: Arc<Deduplicator>,
    pub ledger: Arc<CreditLedger>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<MetricsAggregator>,
    pub tool_client: Arc<ToolClient>,
    pub pipeline: Arc<AdmissionPipeline>,
}

impl CoreServices {
    pub fn new(config: CoreConfig) -> Self {
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let keys = Arc::new(KeyRegistry::new());
        let events = Arc::new(EventEmitter::new());
        let rate_limiter = Arc::new(RateLimiter::new(clock.clone()));
        let plans = Arc::new(PlanResolver::new(keys.clone()));
        let dedup = Arc::new(Deduplicator::new(clock.clone(), config.dedup.clone()));
        let ledger = Arc::new(CreditLedger::new(
            clock.clone(),
            config.ledger.clone(),
            Some(events.clone()),
        ));
        let sessions = Arc::new(SessionManager::new(
            clock.clone(),
            config.session.default_ttl_ms,
            config.session.max_active_sessions,
        ));
        let metrics = Arc::new(MetricsAggregator::new(config.metrics.max_records));
        let tool_client = Arc::new(ToolClient::new(
            config.tool.command.clone(),
            config.tool.args.clone(),
            config.tool.call_timeout_ms,
        ));

        let pipeline = Arc::new(AdmissionPipeline::new(
            rate_limiter.clone(),
            plans.clone(),
            dedup.clone(),
            ledger.clone(),
            sessions.clone(),
            metrics.clone(),
            tool_client.clone(),
            events.clone(),
            config.rate_limit.clone(),
            config.dedup.hash_algorithm,
            clock.clone(),
        ));

        Self {
            config,
            clock,
            keys,
            events,
            rate_limiter,
            plans,
            dedup,
            ledger,
            sessions,
            metrics,
            tool_client,
            pipeline,
        }
    }

    /// Start all detached background tickers (auto-expire, GC). Must be
    /// called from within a tokio runtime.
    pub fn start_background_tasks(&self) {
        self.ledger.start_auto_expire_ticker();
    }

    pub fn shutdown(&self) {
        self.ledger.destroy();
        self.rate_limiter.destroy();
        self.dedup.destroy();
        self.sessions.destroy();
        self.metrics.destroy();
        self.tool_client.destroy();
    }
}
