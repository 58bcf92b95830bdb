//! Session hijack detection from device fingerprint drift.
//!
//! A fingerprint is a fixed-order concatenation of one short SHA-256 segment
//! per device signal, so changing one signal changes one segment and the
//! edit-distance similarity degrades in proportion to how much of the device
//! changed. The client IP is deliberately not a signal: it moves legitimately.
//!
//! Baselines live in the shared [`DataStore`] under `session:{id}` and are
//! only replaced through [`SessionAnomalyDetector::rotate_baseline`]. An
//! anomaly invalidates the baseline rather than overwriting it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, EventType, SecurityEvent};
use crate::error::Result;
use crate::severity::Severity;
use crate::store::DataStore;

pub const SESSION_PREFIX: &str = "session:";

pub const REASON_FINGERPRINT_MISMATCH: &str = "device fingerprint mismatch";
pub const REASON_SCORE_DEGRADED: &str = "security score degraded";
pub const REASON_INVALIDATED: &str = "session invalidated";
pub const REASON_STORE_UNAVAILABLE: &str = "session store unavailable";
pub const REASON_MISSING_FINGERPRINT: &str = "missing device fingerprint";

/// Hex characters kept from each signal digest
const SEGMENT_LEN: usize = 8;
const MAX_CAS_ATTEMPTS: usize = 4;

/// Stable client characteristics reported by the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSignals {
    pub user_agent: String,
    pub language: String,
    pub platform: String,
    /// e.g. `1920x1080`
    pub screen_resolution: String,
    pub color_depth: Option<u32>,
    pub timezone: String,
    pub hardware_concurrency: Option<u32>,
    /// GiB, as reported by the browser
    pub device_memory: Option<f64>,
    pub touch_support: bool,
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Segmented fingerprint of `signals`
pub fn compute_fingerprint(signals: &DeviceSignals) -> String {
    let parts = [
        signals.user_agent.clone(),
        signals.language.clone(),
        signals.platform.clone(),
        signals.screen_resolution.clone(),
        opt(&signals.color_depth),
        signals.timezone.clone(),
        opt(&signals.hardware_concurrency),
        opt(&signals.device_memory),
        signals.touch_support.to_string(),
    ];

    let mut fingerprint = String::with_capacity(parts.len() * SEGMENT_LEN);
    for (index, part) in parts.iter().enumerate() {
        let mut hasher = Sha256::new();
        // Domain-separate segments so equal values in different slots differ
        hasher.update([index as u8]);
        hasher.update(part.as_bytes());
        let digest = hex::encode(hasher.finalize());
        fingerprint.push_str(&digest[..SEGMENT_LEN]);
    }
    fingerprint
}

/// Character-level Levenshtein distance
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - levenshtein(a, b) / max(len(a), len(b))`, in `[0, 1]`
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Severity of a fingerprint mismatch from how far similarity fell short
pub fn severity_for_shortfall(shortfall: f64) -> Severity {
    if shortfall >= 0.5 {
        Severity::Critical
    } else if shortfall >= 0.3 {
        Severity::High
    } else if shortfall >= 0.1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum spacing between full re-checks (ms)
    pub validation_interval_ms: i64,
    /// Similarity below which the device is considered different
    pub anomaly_threshold: f64,
    /// Largest tolerated drop of the tracked security score
    pub max_score_drop: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validation_interval_ms: 300_000, // 5 minutes
            anomaly_threshold: 0.7,
            max_score_drop: 50,
        }
    }
}

/// Stored reference state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBaseline {
    pub session_id: String,
    pub fingerprint: String,
    pub security_score: Option<i32>,
    pub established_at_ms: i64,
    pub last_validated_ms: i64,
    #[serde(default)]
    pub invalidated: bool,
    #[serde(default)]
    pub invalidation_reason: Option<String>,
}

/// Session part of a request: a precomputed fingerprint or raw signals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCheck {
    pub session_id: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub signals: Option<DeviceSignals>,
    #[serde(default)]
    pub security_score: Option<i32>,
}

impl SessionCheck {
    pub fn resolved_fingerprint(&self) -> Option<String> {
        self.fingerprint
            .clone()
            .or_else(|| self.signals.as_ref().map(compute_fingerprint))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidation {
    pub anomaly_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present when a comparison actually ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl SessionValidation {
    fn ok(similarity: Option<f64>) -> Self {
        Self {
            anomaly_detected: false,
            reason: None,
            similarity,
            severity: None,
        }
    }

    fn anomaly(reason: &str, severity: Severity, similarity: Option<f64>) -> Self {
        Self {
            anomaly_detected: true,
            reason: Some(reason.to_string()),
            similarity,
            severity: Some(severity),
        }
    }
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

pub struct SessionAnomalyDetector {
    store: Arc<dyn DataStore>,
    audit: Arc<dyn AuditSink>,
    config: SessionConfig,
}

impl SessionAnomalyDetector {
    pub fn new(store: Arc<dyn DataStore>, audit: Arc<dyn AuditSink>, config: SessionConfig) -> Self {
        info!(
            "Session anomaly detector created (threshold {}, interval {}ms)",
            config.anomaly_threshold, config.validation_interval_ms
        );
        Self { store, audit, config }
    }

    /// Validate the session described by a request
    pub async fn check(&self, check: &SessionCheck, now_ms: i64) -> SessionValidation {
        match check.resolved_fingerprint() {
            Some(fingerprint) => {
                self.validate(&check.session_id, &fingerprint, check.security_score, now_ms)
                    .await
            }
            None => SessionValidation::anomaly(REASON_MISSING_FINGERPRINT, Severity::Medium, None),
        }
    }

    /// Compare `fingerprint` against the session's baseline.
    ///
    /// Fails closed: if the store cannot be reached the session is reported
    /// as anomalous.
    pub async fn validate(
        &self,
        session_id: &str,
        fingerprint: &str,
        security_score: Option<i32>,
        now_ms: i64,
    ) -> SessionValidation {
        match self.try_validate(session_id, fingerprint, security_score, now_ms).await {
            Ok(validation) => validation,
            Err(e) => {
                error!("Session {} check failed, failing closed: {}", session_id, e);
                SessionValidation::anomaly(REASON_STORE_UNAVAILABLE, Severity::Critical, None)
            }
        }
    }

    async fn try_validate(
        &self,
        session_id: &str,
        fingerprint: &str,
        security_score: Option<i32>,
        now_ms: i64,
    ) -> Result<SessionValidation> {
        let key = session_key(session_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;

            let Some(raw) = current else {
                let baseline = SessionBaseline {
                    session_id: session_id.to_string(),
                    fingerprint: fingerprint.to_string(),
                    security_score,
                    established_at_ms: now_ms,
                    last_validated_ms: now_ms,
                    invalidated: false,
                    invalidation_reason: None,
                };
                if self
                    .store
                    .compare_and_swap(&key, None, serde_json::to_value(&baseline)?)
                    .await?
                {
                    debug!("Established baseline for session {}", session_id);
                    return Ok(SessionValidation::ok(None));
                }
                continue;
            };

            let baseline: SessionBaseline = serde_json::from_value(raw.clone())?;

            if baseline.invalidated {
                return Ok(SessionValidation::anomaly(REASON_INVALIDATED, Severity::High, None));
            }

            if now_ms - baseline.last_validated_ms < self.config.validation_interval_ms {
                return Ok(SessionValidation::ok(None));
            }

            let sim = similarity(&baseline.fingerprint, fingerprint);
            let score_drop = match (baseline.security_score, security_score) {
                (Some(before), Some(now)) => before.saturating_sub(now),
                _ => 0,
            };

            let anomaly = if sim < self.config.anomaly_threshold {
                let severity = severity_for_shortfall(self.config.anomaly_threshold - sim);
                Some(SessionValidation::anomaly(REASON_FINGERPRINT_MISMATCH, severity, Some(sim)))
            } else if score_drop > self.config.max_score_drop {
                Some(SessionValidation::anomaly(REASON_SCORE_DEGRADED, Severity::High, Some(sim)))
            } else {
                None
            };

            let mut updated = baseline.clone();
            updated.last_validated_ms = now_ms;
            if let Some(validation) = &anomaly {
                updated.invalidated = true;
                updated.invalidation_reason = validation.reason.clone();
            }

            if !self
                .store
                .compare_and_swap(&key, Some(&raw), serde_json::to_value(&updated)?)
                .await?
            {
                continue;
            }

            return Ok(match anomaly {
                Some(validation) => {
                    self.report(session_id, &validation, score_drop).await;
                    validation
                }
                None => SessionValidation::ok(Some(sim)),
            });
        }

        // Persistent contention: treat like an unreachable store
        Err(crate::error::GuardError::StoreUnavailable(format!(
            "session {} baseline kept changing",
            session_id
        )))
    }

    async fn report(&self, session_id: &str, validation: &SessionValidation, score_drop: i32) {
        let severity = validation.severity.unwrap_or(Severity::High);
        warn!(
            "Session anomaly for {}: {} (similarity {:?})",
            session_id,
            validation.reason.as_deref().unwrap_or_default(),
            validation.similarity
        );
        self.audit
            .append(SecurityEvent::new(
                EventType::SessionAnomaly,
                severity,
                json!({
                    "sessionId": session_id,
                    "reason": validation.reason,
                    "similarity": validation.similarity,
                    "scoreDrop": score_drop,
                }),
            ))
            .await;
    }

    /// Deliberately replace the baseline (after re-authentication)
    pub async fn rotate_baseline(
        &self,
        session_id: &str,
        fingerprint: &str,
        security_score: Option<i32>,
        now_ms: i64,
    ) -> Result<()> {
        let baseline = SessionBaseline {
            session_id: session_id.to_string(),
            fingerprint: fingerprint.to_string(),
            security_score,
            established_at_ms: now_ms,
            last_validated_ms: now_ms,
            invalidated: false,
            invalidation_reason: None,
        };
        info!("Rotating baseline for session {}", session_id);
        self.store
            .upsert(&session_key(session_id), serde_json::to_value(&baseline)?)
            .await
    }

    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.store.delete(&session_key(session_id)).await
    }

    pub async fn baseline(&self, session_id: &str) -> Result<Option<SessionBaseline>> {
        match self.store.get(&session_key(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }
}
