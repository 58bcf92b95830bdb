use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::orchestrator::{Decision, SecurityDecision};

/// Maximum latency samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Decision counters and pipeline latency
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardMetrics {
    pub requests_total: u64,
    pub allowed_total: u64,
    pub monitored_total: u64,
    pub blocked_total: u64,

    pub validation_failures_total: u64,
    pub threats_detected_total: u64,
    pub rate_limited_total: u64,
    pub session_anomalies_total: u64,
    /// Requests blocked because the pipeline itself failed
    pub fail_secure_total: u64,

    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,

    pub uptime_seconds: u64,
    pub timestamp: i64,
}

impl GuardMetrics {
    /// Format metrics in Prometheus format
    pub fn to_prometheus_format(&self) -> String {
        format!(
            "# HELP aegis_guard_requests_total Total requests processed\n\
             # TYPE aegis_guard_requests_total counter\n\
             aegis_guard_requests_total {}\n\
             \n\
             # HELP aegis_guard_decisions_total Decisions by outcome\n\
             # TYPE aegis_guard_decisions_total counter\n\
             aegis_guard_decisions_total{{decision=\"allow\"}} {}\n\
             aegis_guard_decisions_total{{decision=\"monitor\"}} {}\n\
             aegis_guard_decisions_total{{decision=\"block\"}} {}\n\
             \n\
             # HELP aegis_guard_validation_failures_total Requests whose input failed validation\n\
             # TYPE aegis_guard_validation_failures_total counter\n\
             aegis_guard_validation_failures_total {}\n\
             \n\
             # HELP aegis_guard_threats_detected_total Requests with at least one threat signature match\n\
             # TYPE aegis_guard_threats_detected_total counter\n\
             aegis_guard_threats_detected_total {}\n\
             \n\
             # HELP aegis_guard_rate_limited_total Requests denied by the rate limiter\n\
             # TYPE aegis_guard_rate_limited_total counter\n\
             aegis_guard_rate_limited_total {}\n\
             \n\
             # HELP aegis_guard_session_anomalies_total Session anomalies detected\n\
             # TYPE aegis_guard_session_anomalies_total counter\n\
             aegis_guard_session_anomalies_total {}\n\
             \n\
             # HELP aegis_guard_fail_secure_total Requests blocked after a pipeline failure\n\
             # TYPE aegis_guard_fail_secure_total counter\n\
             aegis_guard_fail_secure_total {}\n\
             \n\
             # HELP aegis_guard_latency_milliseconds Average pipeline latency in milliseconds\n\
             # TYPE aegis_guard_latency_milliseconds gauge\n\
             aegis_guard_latency_milliseconds {}\n\
             \n\
             # HELP aegis_guard_latency_p95_milliseconds P95 pipeline latency in milliseconds\n\
             # TYPE aegis_guard_latency_p95_milliseconds gauge\n\
             aegis_guard_latency_p95_milliseconds {}\n\
             \n\
             # HELP aegis_guard_latency_p99_milliseconds P99 pipeline latency in milliseconds\n\
             # TYPE aegis_guard_latency_p99_milliseconds gauge\n\
             aegis_guard_latency_p99_milliseconds {}\n\
             \n\
             # HELP aegis_guard_uptime_seconds Uptime in seconds\n\
             # TYPE aegis_guard_uptime_seconds counter\n\
             aegis_guard_uptime_seconds {}\n",
            self.requests_total,
            self.allowed_total,
            self.monitored_total,
            self.blocked_total,
            self.validation_failures_total,
            self.threats_detected_total,
            self.rate_limited_total,
            self.session_anomalies_total,
            self.fail_secure_total,
            self.avg_latency_ms,
            self.p95_latency_ms,
            self.p99_latency_ms,
            self.uptime_seconds,
        )
    }
}

/// Metrics collector - tracks decisions and latency
pub struct MetricsCollector {
    metrics: Arc<RwLock<GuardMetrics>>,
    start_time: Instant,
    latency_samples: Arc<RwLock<Vec<f64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(GuardMetrics::default())),
            start_time: Instant::now(),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(MAX_LATENCY_SAMPLES))),
        }
    }

    /// Get current metrics snapshot
    pub async fn get_metrics(&self) -> GuardMetrics {
        let mut snapshot = self.metrics.read().await.clone();
        snapshot.uptime_seconds = self.start_time.elapsed().as_secs();
        snapshot.timestamp = chrono::Utc::now().timestamp();
        snapshot
    }

    /// Record one orchestrated decision
    pub async fn record_decision(&self, decision: &SecurityDecision, latency_ms: f64) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.requests_total += 1;
            match decision.decision {
                Decision::Allow => metrics.allowed_total += 1,
                Decision::Monitor => metrics.monitored_total += 1,
                Decision::Block => metrics.blocked_total += 1,
            }
            if decision.validation.as_ref().map(|v| !v.is_valid).unwrap_or(false) {
                metrics.validation_failures_total += 1;
            }
            if decision
                .analysis
                .as_ref()
                .map(|a| !a.detected_threats.is_empty())
                .unwrap_or(false)
            {
                metrics.threats_detected_total += 1;
            }
            if decision.rate_limit.as_ref().map(|r| !r.allowed).unwrap_or(false) {
                metrics.rate_limited_total += 1;
            }
            if decision.session.as_ref().map(|s| s.anomaly_detected).unwrap_or(false) {
                metrics.session_anomalies_total += 1;
            }
        }
        self.record_latency(latency_ms).await;
    }

    pub async fn record_fail_secure(&self) {
        self.metrics.write().await.fail_secure_total += 1;
    }

    async fn record_latency(&self, latency_ms: f64) {
        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);

        // Keep only the most recent samples
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.remove(0);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut metrics = self.metrics.write().await;
        metrics.avg_latency_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        metrics.p50_latency_ms = sorted[sorted.len() / 2];
        metrics.p95_latency_ms = sorted[((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1)];
        metrics.p99_latency_ms = sorted[((sorted.len() as f64 * 0.99) as usize).min(sorted.len() - 1)];
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimitDecision;

    fn decision(kind: Decision, rate_limited: bool) -> SecurityDecision {
        SecurityDecision {
            allowed: kind != Decision::Block,
            sanitized_input: None,
            threats: Vec::new(),
            risk_score: 0,
            decision: kind,
            validation: None,
            analysis: None,
            rate_limit: Some(RateLimitDecision {
                allowed: !rate_limited,
                retry_after_seconds: None,
                remaining: 0,
                reset_time_ms: 0,
                attempt_count: 1,
            }),
            session: None,
        }
    }

    #[tokio::test]
    async fn test_metrics_collector_initialization() {
        let collector = MetricsCollector::new();
        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.requests_total, 0);
        assert_eq!(metrics.blocked_total, 0);
    }

    #[tokio::test]
    async fn test_decisions_are_counted() {
        let collector = MetricsCollector::new();
        collector.record_decision(&decision(Decision::Allow, false), 1.0).await;
        collector.record_decision(&decision(Decision::Monitor, false), 2.0).await;
        collector.record_decision(&decision(Decision::Block, true), 3.0).await;
        collector.record_fail_secure().await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.requests_total, 3);
        assert_eq!(metrics.allowed_total, 1);
        assert_eq!(metrics.monitored_total, 1);
        assert_eq!(metrics.blocked_total, 1);
        assert_eq!(metrics.rate_limited_total, 1);
        assert_eq!(metrics.fail_secure_total, 1);
        assert!((metrics.avg_latency_ms - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_latency_percentiles() {
        let collector = MetricsCollector::new();
        for latency in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            collector.record_decision(&decision(Decision::Allow, false), latency).await;
        }

        let metrics = collector.get_metrics().await;
        assert!(metrics.p50_latency_ms > 0.0);
        assert!(metrics.p95_latency_ms > metrics.p50_latency_ms);
        assert!(metrics.p99_latency_ms >= metrics.p95_latency_ms);
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let collector = MetricsCollector::new();
        collector.record_decision(&decision(Decision::Block, false), 1.0).await;

        let prometheus = collector.get_metrics().await.to_prometheus_format();
        assert!(prometheus.contains("# HELP"));
        assert!(prometheus.contains("# TYPE"));
        assert!(prometheus.contains("aegis_guard_requests_total 1"));
        assert!(prometheus.contains("aegis_guard_decisions_total{decision=\"block\"} 1"));
        assert!(prometheus.contains("aegis_guard_fail_secure_total 0"));
    }
}
