use serde::{Deserialize, Serialize};

/// Digest algorithm used by the Deduplicator (spec.md §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Fast,
    Detailed,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Fast
    }
}

/// Top-level configuration surface (spec.md §6 "Configuration surface").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub metrics: MetricsAggregatorConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub tool: ToolProcessConfig,
}

/// RateLimiter configuration (component A). `max_requests = 0` disables
/// limiting entirely (always allow), per spec.md §4.A "special cases".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_sub_windows")]
    pub sub_windows: u32,

    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            sub_windows: default_sub_windows(),
            max_keys: default_max_keys(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}
fn default_max_requests() -> u32 {
    120
}
fn default_sub_windows() -> u32 {
    6
}
fn default_max_keys() -> usize {
    100_000
}

/// CreditLedger configuration (component C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    #[serde(default = "default_max_reservations_per_key")]
    pub max_reservations_per_key: usize,

    /// `None` means +infinity (spec.md §3 Reservation invariants).
    #[serde(default)]
    pub max_reservation_amount: Option<f64>,

    #[serde(default = "default_auto_expire_interval_ms")]
    pub auto_expire_interval_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl_seconds(),
            max_reservations_per_key: default_max_reservations_per_key(),
            max_reservation_amount: None,
            auto_expire_interval_ms: default_auto_expire_interval_ms(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    300
}
fn default_max_reservations_per_key() -> usize {
    50
}
fn default_auto_expire_interval_ms() -> u64 {
    30_000
}

/// Deduplicator configuration (component B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_dedup_ttl_ms(),
            max_entries: default_max_entries(),
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

fn default_dedup_ttl_ms() -> u64 {
    60_000
}
fn default_max_entries() -> usize {
    50_000
}

/// SessionManager configuration (component E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_session_ttl_ms(),
            max_active_sessions: default_max_active_sessions(),
        }
    }
}

fn default_session_ttl_ms() -> u64 {
    3_600_000
}
fn default_max_active_sessions() -> usize {
    10_000
}

/// MetricsAggregator configuration (component F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsAggregatorConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MetricsAggregatorConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

fn default_max_records() -> usize {
    100_000
}

/// Ambient admin listener configuration (health/metrics only, §1.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,

    /// 0 disables the admin-surface rate limiter (spec.md §6).
    #[serde(default)]
    pub admin_rate_limit: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            admin_rate_limit: 0,
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:9091".to_string()
}

/// Downstream JSON-RPC tool-process configuration (component H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProcessConfig {
    /// Program to spawn, e.g. `"node"`.
    #[serde(default)]
    pub command: String,

    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ToolProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    30_000
}
