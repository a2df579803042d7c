pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl CoreConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway can start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: CoreConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            CoreConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded core configuration");
        Ok(config)
    }

    /// Apply `CREDITGATE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CREDITGATE_RATE_WINDOW_MS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.window_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CREDITGATE_RATE_MAX_REQUESTS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.max_requests = n;
            }
        }
        if let Ok(v) = std::env::var("CREDITGATE_LEDGER_TTL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.ledger.default_ttl_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("CREDITGATE_DEDUP_TTL_MS") {
            if let Ok(n) = v.parse() {
                self.dedup.ttl_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CREDITGATE_ADMIN_LISTEN") {
            self.admin.listen = v;
        }
        if let Ok(v) = std::env::var("CREDITGATE_TOOL_COMMAND") {
            self.tool.command = v;
        }
        if let Ok(v) = std::env::var("CREDITGATE_TOOL_ARGS") {
            self.tool.args = v.split_whitespace().map(|s| s.to_string()).collect();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.sub_windows == 0 {
            anyhow::bail!("rate_limit.sub_windows must be >= 1");
        }
        if self.dedup.max_entries == 0 {
            anyhow::bail!("dedup.max_entries must be >= 1");
        }
        if self.session.max_active_sessions == 0 {
            anyhow::bail!("session.max_active_sessions must be >= 1");
        }
        if let Some(max) = self.ledger.max_reservation_amount {
            if max <= 0.0 {
                anyhow::bail!("ledger.max_reservation_amount must be positive when set");
            }
        }
        Ok(())
    }
}
