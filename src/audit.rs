//! Security event log.
//!
//! Writes are fire-and-forget: an [`AuditSink`] never returns an error to its
//! caller. Reads go straight to the [`DataStore`] the store-backed sink writes
//! into, which is how the threat scorer sees recent failures per IP and user.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::severity::Severity;
use crate::store::{DataStore, StoreFilter};

/// Key prefix for persisted audit events
pub const AUDIT_PREFIX: &str = "audit:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ThreatDetected,
    ValidationFailed,
    RateLimitExceeded,
    AuthFailure,
    SessionAnomaly,
    RequestProcessed,
    RequestFlagged,
    RequestBlocked,
}

impl EventType {
    /// Events that count toward failure bursts and IP reputation
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EventType::AuthFailure
                | EventType::RateLimitExceeded
                | EventType::ValidationFailed
                | EventType::RequestBlocked
        )
    }
}

/// One discrete security event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub data: Value,
    /// User id or rate-limit identifier responsible for the event
    pub actor: Option<String>,
    /// Milliseconds since UNIX epoch
    pub timestamp_ms: i64,
}

impl SecurityEvent {
    pub fn new(event_type: EventType, severity: Severity, data: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            severity,
            data,
            actor: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Client IP recorded in the event payload, if any
    pub fn ip(&self) -> Option<&str> {
        self.data.get("ip").and_then(Value::as_str)
    }

    /// Pipeline run that produced the event, if any
    pub fn request_id(&self) -> Option<&str> {
        self.data.get("requestId").and_then(Value::as_str)
    }

    /// Storage key, ordered by time
    pub fn storage_key(&self) -> String {
        format!("{}:{}", time_key(self.timestamp_ms), self.id)
    }
}

/// Lowest storage key for events at `timestamp_ms`
fn time_key(timestamp_ms: i64) -> String {
    format!("{}{:020}", AUDIT_PREFIX, timestamp_ms.max(0))
}

/// Number of failures among `events`. Failures that share a request id
/// (a blocked request that also failed validation) count once.
pub fn count_failures<'a>(events: impl IntoIterator<Item = &'a SecurityEvent>) -> usize {
    let mut seen_requests = HashSet::new();
    events
        .into_iter()
        .filter(|e| e.event_type.is_failure())
        .filter(|e| match e.request_id() {
            Some(id) => seen_requests.insert(id),
            None => true,
        })
        .count()
}

fn generate_event_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("evt_{}", hex::encode(bytes))
}

/// Id shared by every event of one pipeline run
pub fn new_request_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("req_{}", hex::encode(bytes))
}

/// Destination for security events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an event. Failures are handled (logged) by the sink itself.
    async fn append(&self, event: SecurityEvent);
}

/// Persists events into a [`DataStore`]
pub struct StoreAuditSink {
    store: Arc<dyn DataStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn append(&self, event: SecurityEvent) {
        let key = event.storage_key();
        let record = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize audit event {}: {}", event.id, e);
                return;
            }
        };
        if let Err(e) = self.store.upsert(&key, record).await {
            warn!("Audit write dropped ({:?}): {}", event.event_type, e);
        }
    }
}

/// Emits events as structured log lines only
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: SecurityEvent) {
        match event.severity {
            Severity::Critical | Severity::High => warn!(
                event_type = ?event.event_type,
                severity = %event.severity,
                actor = ?event.actor,
                data = %event.data,
                "security event"
            ),
            _ => info!(
                event_type = ?event.event_type,
                severity = %event.severity,
                actor = ?event.actor,
                data = %event.data,
                "security event"
            ),
        }
    }
}

/// Events recorded at or after `since_ms`, oldest first. Only keys from
/// `since_ms` onward are read.
pub async fn recent_events(store: &dyn DataStore, since_ms: i64) -> Result<Vec<SecurityEvent>> {
    let filter = StoreFilter::prefix(AUDIT_PREFIX).with_start(time_key(since_ms));
    let rows = store.query(&filter).await?;
    let mut events = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        match serde_json::from_value::<SecurityEvent>(value) {
            Ok(event) if event.timestamp_ms >= since_ms => events.push(event),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable audit record {}: {}", key, e),
        }
    }
    Ok(events)
}

/// Delete events recorded before `cutoff_ms`. Returns how many were removed.
pub async fn purge_events_before(store: &dyn DataStore, cutoff_ms: i64) -> Result<usize> {
    let filter = StoreFilter::prefix(AUDIT_PREFIX).with_end(time_key(cutoff_ms));
    let rows = store.query(&filter).await?;
    for (key, _) in &rows {
        store.delete(key).await?;
    }
    if !rows.is_empty() {
        debug!("Audit retention removed {} events", rows.len());
    }
    Ok(rows.len())
}

/// Every `interval`, drop events older than `retention`
pub fn spawn_retention(store: Arc<dyn DataStore>, retention: Duration, interval: Duration) -> JoinHandle<()> {
    info!(
        "Starting audit retention (keep {:?}, interval {:?})",
        retention, interval
    );
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(retention_ms);
            if let Err(e) = purge_events_before(store.as_ref(), cutoff).await {
                warn!("Audit retention failed: {}", e);
            }
        }
    })
}
