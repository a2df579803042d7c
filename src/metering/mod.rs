//! MetricsAggregator (component F) — an in-process ring buffer of recent
//! call outcomes, queryable for percentile/roll-up summaries.
//!
//! Distinct from the ambient `telemetry` module: this is a small
//! query engine over recent samples (spec.md §4.F), not a Prometheus
//! exporter. Grounded on the teacher's `upstream/health.rs` latency
//! ring buffer for the bounded-capacity-with-eviction shape; the
//! percentile math itself is new (the teacher never computes quantiles,
//! only rolling averages).

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub timestamp_ms: i64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub tool: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub tool: Option<String>,
    pub key: Option<String>,
}

impl MetricsFilter {
    fn matches(&self, record: &MetricRecord) -> bool {
        if let Some(tool) = &self.tool {
            if record.tool.as_deref() != Some(tool.as_str()) {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if record.key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolBreakdown {
    pub tool: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsBucket {
    pub start_ms: i64,
    pub end_ms: i64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
}

const MAX_BUCKETS: i64 = 60;
const CLEANUP_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

struct Ring {
    records: std::collections::VecDeque<MetricRecord>,
    max_records: usize,
}

pub struct MetricsAggregator {
    ring: Mutex<Ring>,
}

/// Nearest-rank percentile over an already-sorted slice: `ceil(q * n) - 1`,
/// clamped into bounds.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

impl MetricsAggregator {
    pub fn new(max_records: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                records: std::collections::VecDeque::new(),
                max_records,
            }),
        }
    }

    pub fn record(&self, record: MetricRecord) {
        let mut ring = self.ring.lock().unwrap();
        if ring.records.len() >= ring.max_records {
            ring.records.pop_front();
        }
        ring.records.push_back(record);
    }

    fn snapshot_within(&self, window_ms: i64, now_ms: i64, filter: Option<&MetricsFilter>) -> Vec<MetricRecord> {
        let ring = self.ring.lock().unwrap();
        let cutoff = now_ms - window_ms;
        ring.records
            .iter()
            .filter(|r| r.timestamp_ms >= cutoff)
            .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn get_summary(
        &self,
        window_ms: i64,
        now_ms: i64,
        filter: Option<&MetricsFilter>,
    ) -> MetricsSummary {
        let records = self.snapshot_within(window_ms, now_ms, filter);
        if records.is_empty() {
            return MetricsSummary::default();
        }

        let mut latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();

        let total_requests = records.len() as u64;
        let total_errors = records.iter().filter(|r| r.status_code >= 500).count() as u64;
        let sum: u64 = latencies.iter().sum();

        MetricsSummary {
            total_requests,
            total_errors,
            error_rate: (total_errors as f64 / total_requests as f64) * 100.0,
            avg_latency_ms: sum as f64 / total_requests as f64,
            min_latency_ms: *latencies.first().unwrap(),
            max_latency_ms: *latencies.last().unwrap(),
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
        }
    }

    pub fn get_tool_breakdown(&self, window_ms: i64, now_ms: i64) -> Vec<ToolBreakdown> {
        let records = self.snapshot_within(window_ms, now_ms, None);
        let mut by_tool: HashMap<String, (u64, u64, u64)> = HashMap::new(); // (count, errors, latency_sum)

        for record in &records {
            let Some(tool) = &record.tool else { continue };
            let entry = by_tool.entry(tool.clone()).or_insert((0, 0, 0));
            entry.0 += 1;
            if record.status_code >= 500 {
                entry.1 += 1;
            }
            entry.2 += record.latency_ms;
        }

        let mut out: Vec<ToolBreakdown> = by_tool
            .into_iter()
            .map(|(tool, (count, errors, latency_sum))| ToolBreakdown {
                tool,
                total_requests: count,
                total_errors: errors,
                avg_latency_ms: latency_sum as f64 / count as f64,
            })
            .collect();
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }

    /// Evenly spaced buckets spanning `window_ms` ending at `now_ms`,
    /// capped at `MAX_BUCKETS`.
    pub fn get_buckets(&self, window_ms: i64, now_ms: i64) -> Vec<MetricsBucket> {
        if window_ms <= 0 {
            return Vec::new();
        }
        let bucket_count = window_ms.min(MAX_BUCKETS).max(1);
        let bucket_width = (window_ms as f64 / bucket_count as f64).ceil() as i64;
        let start = now_ms - window_ms;

        let records = self.snapshot_within(window_ms, now_ms, None);
        let mut buckets: Vec<MetricsBucket> = (0..bucket_count)
            .map(|i| MetricsBucket {
                start_ms: start + i * bucket_width,
                end_ms: start + (i + 1) * bucket_width,
                total_requests: 0,
                total_errors: 0,
                avg_latency_ms: 0.0,
            })
            .collect();
        let mut latency_sum = vec![0u64; buckets.len()];

        for record in &records {
            let offset = (record.timestamp_ms - start).max(0);
            let idx = ((offset / bucket_width) as usize).min(buckets.len() - 1);
            buckets[idx].total_requests += 1;
            latency_sum[idx] += record.latency_ms;
            if record.status_code >= 500 {
                buckets[idx].total_errors += 1;
            }
        }
        for (bucket, sum) in buckets.iter_mut().zip(latency_sum) {
            if bucket.total_requests > 0 {
                bucket.avg_latency_ms = sum as f64 / bucket.total_requests as f64;
            }
        }
        buckets
    }

    /// Drop records older than 24h. Returns the number removed.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let mut ring = self.ring.lock().unwrap();
        let before = ring.records.len();
        ring.records
            .retain(|r| now_ms.saturating_sub(r.timestamp_ms) <= CLEANUP_MAX_AGE_MS);
        before - ring.records.len()
    }

    pub fn destroy(&self) {
        self.ring.lock().unwrap().records.clear();
    }
}
