//! Threat scoring: signature matches plus caller reputation and behavior.
//!
//! `risk_score = min(100, pattern + ip + behavior)`. The IP and behavior parts
//! are best-effort lookups against the audit log and the reputation oracle;
//! a timeout or failure in either contributes 0 and never fails the analysis.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::audit::{count_failures, recent_events, AuditSink, EventType, SecurityEvent};
use crate::behavior::{BehavioralAnalyzer, BehavioralConfig};
use crate::error::Result;
use crate::patterns::{PatternCatalog, ThreatPattern, CATEGORY_SCANNER};
use crate::reputation::{IpReputationOracle, ThreatContext};
use crate::severity::Severity;
use crate::store::DataStore;

/// Upper bound of the IP reputation contribution
pub const MAX_IP_SCORE: u32 = 60;
/// Upper bound of the oracle's share of the IP contribution
const MAX_ORACLE_POINTS: u32 = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Freshness of cached IP reputation (seconds)
    pub ip_cache_ttl_secs: u64,
    /// Maximum number of cached IPs
    pub ip_cache_capacity: usize,
    /// Timeout for each best-effort lookup (ms)
    pub lookup_timeout_ms: u64,
    /// How far back failures count against an IP (ms)
    pub ip_failure_window_ms: i64,
    /// Input prefix length kept in ThreatDetected events
    pub audit_input_limit: usize,
    /// Match the user agent against scanner signatures
    pub scan_user_agent: bool,
    /// How long audit events are kept (seconds); must cover every lookback
    pub audit_retention_secs: u64,
    pub behavior: BehavioralConfig,
}

impl ScorerConfig {
    /// Longest span of audit history any score looks at (ms)
    pub fn longest_lookback_ms(&self) -> i64 {
        self.ip_failure_window_ms
            .max(self.behavior.diversity_window_ms)
            .max(self.behavior.burst_window_ms)
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            ip_cache_ttl_secs: 3600,
            ip_cache_capacity: 10_000,
            lookup_timeout_ms: 250,
            ip_failure_window_ms: 3_600_000,
            audit_input_limit: 200,
            scan_user_agent: true,
            audit_retention_secs: 3600,
            behavior: BehavioralConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    BlockAndAlert,
    FlagForReview,
    LogAndMonitor,
    LogOnly,
}

/// Pure mapping from the worst match and the total risk to an action
pub fn recommended_action(max_severity: Severity, risk_score: u32) -> RecommendedAction {
    if max_severity == Severity::Critical || risk_score >= 75 {
        RecommendedAction::BlockAndAlert
    } else if max_severity == Severity::High || risk_score >= 50 {
        RecommendedAction::FlagForReview
    } else if max_severity == Severity::Medium || risk_score >= 25 {
        RecommendedAction::LogAndMonitor
    } else {
        RecommendedAction::LogOnly
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatAnalysis {
    pub threat_level: Severity,
    /// Matched categories, first-seen order, no duplicates
    pub detected_threats: Vec<String>,
    /// 0..=100
    pub risk_score: u32,
    pub should_block: bool,
    pub recommended_action: RecommendedAction,
    pub pattern_score: u32,
    pub ip_score: u32,
    pub behavior_score: u32,
}

#[derive(Debug, Clone, Copy)]
struct CachedReputation {
    score: u32,
    computed_at_ms: i64,
}

pub struct ThreatScorer {
    catalog: Arc<PatternCatalog>,
    /// Audit log reads
    store: Arc<dyn DataStore>,
    audit: Arc<dyn AuditSink>,
    oracle: Option<Arc<dyn IpReputationOracle>>,
    behavior: BehavioralAnalyzer,
    ip_cache: RwLock<HashMap<String, CachedReputation>>,
    config: ScorerConfig,
}

impl ThreatScorer {
    pub fn new(
        catalog: Arc<PatternCatalog>,
        store: Arc<dyn DataStore>,
        audit: Arc<dyn AuditSink>,
        config: ScorerConfig,
    ) -> Self {
        info!(
            "Threat scorer created with {} patterns (lookup timeout {}ms)",
            catalog.len(),
            config.lookup_timeout_ms
        );
        Self {
            catalog,
            store,
            audit,
            oracle: None,
            behavior: BehavioralAnalyzer::with_config(config.behavior.clone()),
            ip_cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn IpReputationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lookup_timeout_ms)
    }

    /// Score `input` in the light of who sent it
    pub async fn analyze(&self, input: &str, context: &ThreatContext) -> ThreatAnalysis {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut matched: Vec<&ThreatPattern> = self.catalog.matches(input);
        if self.config.scan_user_agent {
            if let Some(ua) = context.user_agent.as_deref() {
                matched.extend(self.catalog.scan_category(ua, CATEGORY_SCANNER));
            }
        }

        let mut pattern_score: u32 = 0;
        let mut max_severity = Severity::Low;
        let mut detected_threats: Vec<String> = Vec::new();

        for pattern in &matched {
            pattern_score += pattern.weight();
            max_severity = max_severity.max(pattern.severity);
            if !detected_threats.contains(&pattern.category) {
                detected_threats.push(pattern.category.clone());
            }
            if pattern.severity > Severity::Medium {
                self.record_detection(pattern, input, context);
            }
        }

        let ip_score = match context.ip_address.as_deref() {
            Some(ip) => self.ip_score(ip, now_ms).await,
            None => 0,
        };
        let behavior_score = match context.user_id.as_deref() {
            Some(user_id) => self.behavior_score(user_id, now_ms).await,
            None => 0,
        };

        let risk_score = (pattern_score + ip_score + behavior_score).min(100);
        let should_block = risk_score >= 75 || max_severity == Severity::Critical;
        let threat_level = max_severity.max(Severity::from_score(risk_score));

        debug!(
            "Threat analysis: pattern={} ip={} behavior={} risk={} level={}",
            pattern_score, ip_score, behavior_score, risk_score, threat_level
        );

        ThreatAnalysis {
            threat_level,
            detected_threats,
            risk_score,
            should_block,
            recommended_action: recommended_action(max_severity, risk_score),
            pattern_score,
            ip_score,
            behavior_score,
        }
    }

    /// Drop the cached reputation for `ip`
    pub async fn invalidate_ip(&self, ip: &str) {
        self.ip_cache.write().await.remove(ip);
    }

    pub async fn cached_ips(&self) -> usize {
        self.ip_cache.read().await.len()
    }

    /// Queue a ThreatDetected event; the write runs detached from the request
    fn record_detection(&self, pattern: &ThreatPattern, input: &str, context: &ThreatContext) {
        let truncated: String = input.chars().take(self.config.audit_input_limit).collect();
        let mut event = SecurityEvent::new(
            EventType::ThreatDetected,
            pattern.severity,
            json!({
                "category": pattern.category,
                "pattern": pattern.name,
                "input": truncated,
                "ip": context.ip_address,
                "userAgent": context.user_agent,
                "userId": context.user_id,
            }),
        );
        if let Some(user_id) = &context.user_id {
            event = event.with_actor(user_id.clone());
        }

        let audit = self.audit.clone();
        let limit = self.lookup_timeout();
        let pattern_name = pattern.name.clone();
        tokio::spawn(async move {
            if timeout(limit, audit.append(event)).await.is_err() {
                warn!("Audit write for {} timed out", pattern_name);
            }
        });
    }

    async fn ip_score(&self, ip: &str, now_ms: i64) -> u32 {
        let ttl_ms = (self.config.ip_cache_ttl_secs * 1000) as i64;

        if let Some(cached) = self.ip_cache.read().await.get(ip) {
            if now_ms - cached.computed_at_ms < ttl_ms {
                return cached.score;
            }
        }

        let score = match timeout(self.lookup_timeout(), self.compute_ip_score(ip, now_ms)).await {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => {
                warn!("IP reputation lookup for {} failed: {}", ip, e);
                return 0;
            }
            Err(_) => {
                warn!("IP reputation lookup for {} timed out", ip);
                return 0;
            }
        };

        let mut cache = self.ip_cache.write().await;
        if cache.len() >= self.config.ip_cache_capacity && !cache.contains_key(ip) {
            cache.retain(|_, entry| now_ms - entry.computed_at_ms < ttl_ms);
            if cache.len() >= self.config.ip_cache_capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.computed_at_ms)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            ip.to_string(),
            CachedReputation {
                score,
                computed_at_ms: now_ms,
            },
        );
        score
    }

    async fn compute_ip_score(&self, ip: &str, now_ms: i64) -> Result<u32> {
        let events = recent_events(self.store.as_ref(), now_ms - self.config.ip_failure_window_ms).await?;
        let failures = count_failures(events.iter().filter(|e| e.ip() == Some(ip)));

        let failure_points = match failures {
            n if n >= 10 => 40,
            n if n >= 5 => 25,
            n if n >= 1 => 10,
            _ => 0,
        };

        let oracle_points = match &self.oracle {
            Some(oracle) => match oracle.score(ip).await {
                Ok(score) => u32::from(score.min(100)) * MAX_ORACLE_POINTS / 100,
                Err(e) => {
                    warn!("Reputation oracle failed for {}: {}", ip, e);
                    0
                }
            },
            None => 0,
        };

        Ok((failure_points + oracle_points).min(MAX_IP_SCORE))
    }

    async fn behavior_score(&self, user_id: &str, now_ms: i64) -> u32 {
        let since = now_ms - self.behavior.config().diversity_window_ms;
        match timeout(self.lookup_timeout(), recent_events(self.store.as_ref(), since)).await {
            Ok(Ok(events)) => self.behavior.analyze(&events, user_id, now_ms).score,
            Ok(Err(e)) => {
                warn!("Behavior lookup for {} failed: {}", user_id, e);
                0
            }
            Err(_) => {
                warn!("Behavior lookup for {} timed out", user_id);
                0
            }
        }
    }
}
