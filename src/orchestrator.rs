//! Request-level composition of validation, threat scoring, rate limiting
//! and session checks into one `allow | monitor | block` recommendation.
//!
//! Every stage runs even when an earlier one already recommends blocking, so
//! the full threat list is available for logging. Component risks are
//! combined with `max`, never summed.
//!
//! Failure policy differs per stage and is kept local to each component: the
//! rate limiter fails open, the session detector fails closed, and anything
//! unexpected at this level (an error from a collaborator or a panic) turns
//! the whole request into a block with risk 100.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{new_request_id, purge_events_before, spawn_retention, AuditSink, EventType, SecurityEvent, StoreAuditSink};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::lock_utils::lock_or_recover;
use crate::metrics::MetricsCollector;
use crate::patterns::PatternCatalog;
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::reputation::{ContextEnricher, IpReputationOracle, RequestMetadata, ThreatContext, TrustedProxyEnricher};
use crate::rule_engine::{RuleEngine, ValidationContext, ValidationResult};
use crate::session::{SessionAnomalyDetector, SessionCheck, SessionValidation};
use crate::severity::Severity;
use crate::store::DataStore;
use crate::threat_scorer::{ThreatAnalysis, ThreatScorer};

pub const THREAT_VALIDATION_FAILED: &str = "validation_failed";
pub const THREAT_RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
pub const THREAT_SESSION_ANOMALY: &str = "session_anomaly";
pub const THREAT_PIPELINE_FAILURE: &str = "pipeline_failure";

/// Risk assigned when the pipeline itself fails
const FAIL_SECURE_RISK: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Aggregate risk at or above which requests are blocked
    pub block_threshold: u32,
    /// Aggregate risk at or above which requests are flagged for monitoring
    pub alert_threshold: u32,
    /// Rule set used when a request names no input type
    pub default_input_type: String,
    /// Headers carrying the client IP, checked in order behind a trusted proxy
    pub trusted_headers: Vec<String>,
    /// Proxy addresses (exact or IPv4 CIDR) whose forwarding headers are honored
    pub trusted_proxies: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let enricher = TrustedProxyEnricher::default();
        Self {
            block_threshold: 75,
            alert_threshold: 50,
            default_input_type: crate::validators::TYPE_GENERAL.to_string(),
            trusted_headers: enricher.trusted_headers,
            trusted_proxies: enricher.trusted_proxies,
        }
    }
}

impl OrchestratorConfig {
    /// Map an aggregate risk score onto a decision
    pub fn decide(&self, risk_score: u32) -> Decision {
        if risk_score >= self.block_threshold {
            Decision::Block
        } else if risk_score >= self.alert_threshold {
            Decision::Monitor
        } else {
            Decision::Allow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    /// Allowed, but flagged
    Monitor,
    Block,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Monitor => f.write_str("monitor"),
            Decision::Block => f.write_str("block"),
        }
    }
}

/// One request to evaluate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRequest {
    #[serde(default)]
    pub input: Option<Value>,
    /// Rule set for `input`; defaults to `general`
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub context: ThreatContext,
    /// Connection metadata resolved server-side into `context`
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
    pub action_name: String,
    pub identifier: String,
    #[serde(default)]
    pub session: Option<SessionCheck>,
}

impl SecurityRequest {
    pub fn new(action_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            action_name: action_name.into(),
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_input_type(mut self, input_type: impl Into<String>) -> Self {
        self.input_type = Some(input_type.into());
        self
    }

    pub fn with_context(mut self, context: ThreatContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_session(mut self, session: SessionCheck) -> Self {
        self.session = Some(session);
        self
    }
}

/// Recommendation for one request plus the component results behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_input: Option<Value>,
    pub threats: Vec<String>,
    /// 0..=100
    pub risk_score: u32,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ThreatAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionValidation>,
}

impl SecurityDecision {
    /// Blocking decision used whenever the pipeline cannot finish
    pub fn fail_secure() -> Self {
        Self {
            allowed: false,
            sanitized_input: None,
            threats: vec![THREAT_PIPELINE_FAILURE.to_string()],
            risk_score: FAIL_SECURE_RISK,
            decision: Decision::Block,
            validation: None,
            analysis: None,
            rate_limit: None,
            session: None,
        }
    }
}

// ============================================
// Builder
// ============================================

/// Collects the orchestrator's collaborators. Only the data store is required.
pub struct SecurityOrchestratorBuilder {
    store: Option<Arc<dyn DataStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    catalog: Option<Arc<PatternCatalog>>,
    oracle: Option<Arc<dyn IpReputationOracle>>,
    enricher: Option<Arc<dyn ContextEnricher>>,
    metrics: Option<Arc<MetricsCollector>>,
    config: GuardConfig,
}

impl SecurityOrchestratorBuilder {
    fn new() -> Self {
        Self {
            store: None,
            audit: None,
            catalog: None,
            oracle: None,
            enricher: None,
            metrics: None,
            config: GuardConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to a [`StoreAuditSink`] over the data store
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Defaults to the catalog described by `config.patterns`
    pub fn catalog(mut self, catalog: Arc<PatternCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn IpReputationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Defaults to a [`TrustedProxyEnricher`] built from `config.orchestrator`
    pub fn enricher(mut self, enricher: Arc<dyn ContextEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SecurityOrchestrator> {
        let store = self
            .store
            .ok_or_else(|| GuardError::Config("a data store is required".to_string()))?;
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(StoreAuditSink::new(store.clone())));
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => PatternCatalog::load(&self.config.patterns)?,
        };
        let enricher = self.enricher.unwrap_or_else(|| {
            Arc::new(TrustedProxyEnricher {
                trusted_headers: self.config.orchestrator.trusted_headers.clone(),
                trusted_proxies: self.config.orchestrator.trusted_proxies.clone(),
            })
        });

        let rule_engine = RuleEngine::with_default_rules(&self.config.rule_engine, catalog.clone());

        let mut scorer = ThreatScorer::new(catalog.clone(), store.clone(), audit.clone(), self.config.scorer.clone());
        if let Some(oracle) = self.oracle {
            scorer = scorer.with_oracle(oracle);
        }

        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), self.config.rate_limits.clone()));
        let sessions = SessionAnomalyDetector::new(store.clone(), audit.clone(), self.config.session.clone());

        info!(
            "Security orchestrator ready (block >= {}, monitor >= {}, {} patterns)",
            self.config.orchestrator.block_threshold,
            self.config.orchestrator.alert_threshold,
            catalog.len()
        );

        Ok(SecurityOrchestrator {
            rule_engine,
            scorer,
            rate_limiter,
            sessions,
            store,
            audit,
            enricher,
            retention: Mutex::new(None),
            metrics: self.metrics.unwrap_or_default(),
            audit_timeout: Duration::from_millis(self.config.scorer.lookup_timeout_ms),
            config: self.config,
        })
    }
}

// ============================================
// Orchestrator
// ============================================

pub struct SecurityOrchestrator {
    rule_engine: RuleEngine,
    scorer: ThreatScorer,
    rate_limiter: Arc<RateLimiter>,
    sessions: SessionAnomalyDetector,
    store: Arc<dyn DataStore>,
    audit: Arc<dyn AuditSink>,
    enricher: Arc<dyn ContextEnricher>,
    retention: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsCollector>,
    audit_timeout: Duration,
    config: GuardConfig,
}

impl SecurityOrchestrator {
    pub fn builder() -> SecurityOrchestratorBuilder {
        SecurityOrchestratorBuilder::new()
    }

    pub fn rule_engine(&self) -> &RuleEngine {
        &self.rule_engine
    }

    pub fn scorer(&self) -> &ThreatScorer {
        &self.scorer
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &SessionAnomalyDetector {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Start the rate limit sweeper and audit retention if an interval is
    /// configured
    pub fn start_background_tasks(&self) {
        let interval = self.config.rate_limits.sweep_interval_secs;
        if interval > 0 {
            let interval = Duration::from_secs(interval);
            self.rate_limiter.spawn_sweeper(interval);

            let retention = Duration::from_secs(self.config.scorer.audit_retention_secs);
            let handle = spawn_retention(self.store.clone(), retention, interval);
            if let Some(previous) = lock_or_recover(&self.retention, "audit retention handle").replace(handle) {
                previous.abort();
            }
        }
    }

    /// One maintenance pass at `now_ms`: expired rate-limit records and audit
    /// events past retention. Returns how many records were removed.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        let retention_ms = i64::try_from(self.config.scorer.audit_retention_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .unwrap_or(i64::MAX);
        let limits = self.rate_limiter.sweep(now_ms).await?;
        let events = purge_events_before(self.store.as_ref(), now_ms.saturating_sub(retention_ms)).await?;
        Ok(limits + events)
    }

    /// Evaluate one request. Never fails: an error or panic anywhere in the
    /// sequence yields [`SecurityDecision::fail_secure`].
    pub async fn process_request(&self, request: SecurityRequest) -> SecurityDecision {
        let started = Instant::now();

        let decision = match AssertUnwindSafe(self.run_pipeline(&request)).catch_unwind().await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(
                    "Security pipeline failed for {}:{}, blocking: {}",
                    request.action_name, request.identifier, e
                );
                self.fail_secure(&request).await
            }
            Err(panic) => {
                error!(
                    "Security pipeline panicked for {}:{}, blocking: {}",
                    request.action_name,
                    request.identifier,
                    panic_message(panic.as_ref())
                );
                self.fail_secure(&request).await
            }
        };

        self.metrics
            .record_decision(&decision, started.elapsed().as_secs_f64() * 1000.0)
            .await;
        decision
    }

    async fn run_pipeline(&self, request: &SecurityRequest) -> Result<SecurityDecision> {
        let mut context = request.context.clone();
        if let Some(metadata) = &request.metadata {
            self.enricher.enrich(metadata, &mut context).await?;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let request_id = new_request_id();

        // (a) validation
        let validation = match &request.input {
            Some(input) => {
                let input_type = request
                    .input_type
                    .as_deref()
                    .unwrap_or(&self.config.orchestrator.default_input_type);
                let validation_context = ValidationContext::new(serde_json::to_value(&context)?);
                Some(self.rule_engine.validate(input_type, input, Some(&validation_context)))
            }
            None => None,
        };
        let sanitized_input = validation.as_ref().and_then(|v| v.sanitized_value.clone());

        // (b) threat analysis of what the caller would actually use
        let subject = sanitized_input.as_ref().or(request.input.as_ref());
        let analysis = self.scorer.analyze(&analysis_text(subject), &context).await;

        // (c) rate limit
        let rate_limit = self
            .rate_limiter
            .check_and_record_at(&request.identifier, &request.action_name, now_ms)
            .await;

        // (d) session
        let session = match &request.session {
            Some(check) => Some(self.sessions.check(check, now_ms).await),
            None => None,
        };

        let mut risk_score = analysis.risk_score;
        let mut threats = analysis.detected_threats.clone();

        if let Some(result) = validation.as_ref().filter(|v| !v.is_valid) {
            risk_score = risk_score.max(result.risk_level.weight());
            threats.push(THREAT_VALIDATION_FAILED.to_string());
            self.emit(
                EventType::ValidationFailed,
                result.risk_level,
                &request_id,
                request,
                &context,
                json!({ "errors": result.errors }),
            )
            .await;
        }

        if !rate_limit.allowed {
            risk_score = 100;
            threats.push(THREAT_RATE_LIMIT_EXCEEDED.to_string());
            self.emit(
                EventType::RateLimitExceeded,
                Severity::Medium,
                &request_id,
                request,
                &context,
                json!({ "retryAfterSeconds": rate_limit.retry_after_seconds }),
            )
            .await;
        }

        if let Some(result) = session.as_ref().filter(|s| s.anomaly_detected) {
            risk_score = risk_score.max(result.severity.unwrap_or(Severity::High).weight());
            threats.push(THREAT_SESSION_ANOMALY.to_string());
        }

        let risk_score = risk_score.min(100);
        let decision = self.config.orchestrator.decide(risk_score);

        match decision {
            Decision::Block => {
                warn!(
                    "Blocked {}:{} (risk {}, threats {:?})",
                    request.action_name, request.identifier, risk_score, threats
                );
                self.emit(
                    EventType::RequestBlocked,
                    Severity::High,
                    &request_id,
                    request,
                    &context,
                    json!({ "riskScore": risk_score, "threats": threats }),
                )
                .await;
            }
            Decision::Monitor => {
                info!(
                    "Flagged {}:{} (risk {}, threats {:?})",
                    request.action_name, request.identifier, risk_score, threats
                );
                self.emit(
                    EventType::RequestFlagged,
                    Severity::Medium,
                    &request_id,
                    request,
                    &context,
                    json!({ "riskScore": risk_score, "threats": threats }),
                )
                .await;
            }
            Decision::Allow => {
                debug!("Allowed {}:{} (risk {})", request.action_name, request.identifier, risk_score);
                self.emit(
                    EventType::RequestProcessed,
                    Severity::Low,
                    &request_id,
                    request,
                    &context,
                    json!({ "riskScore": risk_score }),
                )
                .await;
            }
        }

        Ok(SecurityDecision {
            allowed: decision != Decision::Block,
            sanitized_input,
            threats,
            risk_score,
            decision,
            validation,
            analysis: Some(analysis),
            rate_limit: Some(rate_limit),
            session,
        })
    }

    async fn fail_secure(&self, request: &SecurityRequest) -> SecurityDecision {
        self.metrics.record_fail_secure().await;
        // The enricher may be what failed, so only the caller-supplied context is used
        self.emit(
            EventType::RequestBlocked,
            Severity::Critical,
            &new_request_id(),
            request,
            &request.context,
            json!({ "riskScore": FAIL_SECURE_RISK, "reason": THREAT_PIPELINE_FAILURE }),
        )
        .await;
        SecurityDecision::fail_secure()
    }

    /// Report a failed authentication from the identity provider. Feeds IP
    /// and behavioral scoring for later requests.
    pub async fn record_auth_failure(&self, identifier: &str, ip: Option<&str>, user_id: Option<&str>) {
        let event = SecurityEvent::new(
            EventType::AuthFailure,
            Severity::Medium,
            json!({ "identifier": identifier, "ip": ip }),
        )
        .with_actor(user_id.unwrap_or(identifier));
        self.append(event).await;

        if let Some(ip) = ip {
            self.scorer.invalidate_ip(ip).await;
        }
    }

    async fn emit(
        &self,
        event_type: EventType,
        severity: Severity,
        request_id: &str,
        request: &SecurityRequest,
        context: &ThreatContext,
        mut data: Value,
    ) {
        if let Value::Object(map) = &mut data {
            map.insert("requestId".to_string(), json!(request_id));
            map.insert("action".to_string(), json!(request.action_name));
            map.insert("identifier".to_string(), json!(request.identifier));
            map.insert("ip".to_string(), json!(context.ip_address));
        }
        let actor = context.user_id.as_deref().unwrap_or(&request.identifier);
        self.append(SecurityEvent::new(event_type, severity, data).with_actor(actor))
            .await;
    }

    async fn append(&self, event: SecurityEvent) {
        let event_type = event.event_type;
        if timeout(self.audit_timeout, self.audit.append(event)).await.is_err() {
            warn!("Audit write for {:?} timed out", event_type);
        }
    }
}

impl Drop for SecurityOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = lock_or_recover(&self.retention, "audit retention handle").take() {
            handle.abort();
        }
    }
}

/// Text handed to the threat scorer for a (possibly non-string) input
fn analysis_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
