use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::orchestrator::OrchestratorConfig;
use crate::patterns::PatternSourceConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::rule_engine::RuleEngineConfig;
use crate::session::SessionConfig;
use crate::store::{DataStore, MemoryStore, SqliteStore};
use crate::threat_scorer::ScorerConfig;

/// Longest configurable window, lockout or decay period (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

/// Guard configuration. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub server: ServerConfig,
    pub rule_engine: RuleEngineConfig,
    pub scorer: ScorerConfig,
    pub rate_limits: RateLimitConfig,
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub patterns: PatternSourceConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file for the sqlite backend
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("aegis-guard.db"),
        }
    }
}

impl StoreConfig {
    /// Open the configured data store
    pub fn open(&self) -> anyhow::Result<Arc<dyn DataStore>> {
        Ok(match self.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::open(&self.sqlite_path)
                    .with_context(|| format!("Failed to open store {:?}", self.sqlite_path))?,
            ),
        })
    }
}

impl GuardConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: GuardConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        let orch = &self.orchestrator;
        if orch.block_threshold > 100 || orch.alert_threshold > 100 {
            anyhow::bail!("Invalid thresholds: must be within 0..=100");
        }
        if orch.alert_threshold > orch.block_threshold {
            anyhow::bail!(
                "Invalid thresholds: alert_threshold ({}) exceeds block_threshold ({})",
                orch.alert_threshold,
                orch.block_threshold
            );
        }
        if orch.default_input_type.trim().is_empty() {
            anyhow::bail!("Invalid default_input_type: cannot be empty");
        }

        let limits = &self.rate_limits;
        for (action, policy) in
            std::iter::once(("default", &limits.default)).chain(limits.actions.iter().map(|(a, p)| (a.as_str(), p)))
        {
            if policy.max_attempts == 0 || policy.window_secs == 0 {
                anyhow::bail!("Invalid rate limit for '{}': attempts and window must be > 0", action);
            }
            if policy.window_secs > MAX_DURATION_SECS || policy.block_secs > MAX_DURATION_SECS {
                anyhow::bail!(
                    "Invalid rate limit for '{}': window and block must be <= {}s",
                    action,
                    MAX_DURATION_SECS
                );
            }
        }
        if limits.violation_decay_secs > MAX_DURATION_SECS {
            anyhow::bail!("Invalid violation_decay_secs: must be <= {}s", MAX_DURATION_SECS);
        }
        if limits.max_block_multiplier < 1 {
            anyhow::bail!("Invalid max_block_multiplier: must be >= 1");
        }
        if limits.max_cas_retries == 0 {
            anyhow::bail!("Invalid max_cas_retries: must be > 0");
        }

        if !(0.0..=1.0).contains(&self.session.anomaly_threshold) {
            anyhow::bail!(
                "Invalid session anomaly_threshold {}: must be within 0..=1",
                self.session.anomaly_threshold
            );
        }
        if self.session.validation_interval_ms < 0 {
            anyhow::bail!("Invalid session validation_interval_ms: cannot be negative");
        }

        if self.scorer.lookup_timeout_ms == 0 {
            anyhow::bail!("Invalid scorer lookup_timeout_ms: must be > 0");
        }
        if self.scorer.ip_cache_capacity == 0 {
            anyhow::bail!("Invalid scorer ip_cache_capacity: must be > 0");
        }
        let lookback_secs = u64::try_from(self.scorer.longest_lookback_ms().max(0) / 1000).unwrap_or(0);
        if self.scorer.audit_retention_secs < lookback_secs {
            anyhow::bail!(
                "Invalid scorer audit_retention_secs {}: must cover the {}s scoring lookback",
                self.scorer.audit_retention_secs,
                lookback_secs
            );
        }

        if self.server.max_body_bytes == 0 {
            anyhow::bail!("Invalid server max_body_bytes: must be > 0");
        }

        Ok(())
    }
}
