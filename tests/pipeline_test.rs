// End-to-end tests for the orchestrated security pipeline
//
// Each test builds a full orchestrator over an isolated store and drives it
// through the public API only.

use aegis_guard::audit::{recent_events, EventType};
use aegis_guard::config::{GuardConfig, StoreBackend, StoreConfig};
use aegis_guard::orchestrator::{
    Decision, SecurityOrchestrator, SecurityRequest, THREAT_RATE_LIMIT_EXCEEDED, THREAT_VALIDATION_FAILED,
};
use aegis_guard::patterns::CATEGORY_XSS;
use aegis_guard::reputation::ThreatContext;
use aegis_guard::rule_engine::{ValidationContext, ValidationResult, ValidationRule};
use aegis_guard::session::{compute_fingerprint, DeviceSignals, SessionCheck};
use aegis_guard::{MemoryStore, Severity};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn orchestrator() -> (SecurityOrchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orch = SecurityOrchestrator::builder().store(store.clone()).build().unwrap();
    (orch, store)
}

fn desktop() -> DeviceSignals {
    DeviceSignals {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".to_string(),
        language: "en-US".to_string(),
        platform: "Linux x86_64".to_string(),
        screen_resolution: "2560x1440".to_string(),
        color_depth: Some(24),
        timezone: "Europe/Berlin".to_string(),
        hardware_concurrency: Some(16),
        device_memory: Some(8.0),
        touch_support: false,
    }
}

fn phone() -> DeviceSignals {
    DeviceSignals {
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Safari/604.1".to_string(),
        language: "pt-BR".to_string(),
        platform: "iPhone".to_string(),
        screen_resolution: "390x844".to_string(),
        color_depth: Some(32),
        timezone: "America/Sao_Paulo".to_string(),
        hardware_concurrency: Some(6),
        device_memory: None,
        touch_support: true,
    }
}

#[tokio::test]
async fn test_sql_injection_is_blocked() {
    let (orch, _store) = orchestrator();

    let analysis = orch
        .scorer()
        .analyze("'; DROP TABLE users; --", &ThreatContext::default())
        .await;
    assert!(analysis.threat_level >= Severity::High);
    assert!(analysis.should_block);

    let decision = orch
        .process_request(SecurityRequest::new("api", "client-sqli").with_input("'; DROP TABLE users; --"))
        .await;
    assert_eq!(decision.decision, Decision::Block);
    assert!(!decision.allowed);
    assert!(decision.threats.contains(&"sql_injection".to_string()));
}

#[tokio::test]
async fn test_benign_input_is_allowed() {
    let (orch, _store) = orchestrator();

    let analysis = orch.scorer().analyze("Hello, world!", &ThreatContext::default()).await;
    assert!(analysis.risk_score < 10);
    assert!(!analysis.should_block);

    let decision = orch
        .process_request(SecurityRequest::new("api", "client-benign").with_input("Hello, world!"))
        .await;
    assert_eq!(decision.decision, Decision::Allow);
    assert!(decision.allowed);
    assert!(decision.risk_score < 10);
}

#[tokio::test]
async fn test_xss_form_submission_is_blocked() {
    let (orch, store) = orchestrator();

    let decision = orch
        .process_request(
            SecurityRequest::new("form_submission", "ip:1.2.3.4")
                .with_input("<script>alert(1)</script>")
                .with_context(ThreatContext::default().with_ip("1.2.3.4")),
        )
        .await;

    assert_eq!(decision.decision, Decision::Block);
    assert!(!decision.allowed);
    assert!(decision.risk_score >= 50);
    assert!(decision.threats.contains(&CATEGORY_XSS.to_string()));
    assert!(decision.threats.contains(&THREAT_VALIDATION_FAILED.to_string()));

    // Detection events are written in the background
    tokio::task::yield_now().await;
    let events = recent_events(store.as_ref(), 0).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ThreatDetected));
    assert!(events.iter().any(|e| e.event_type == EventType::RequestBlocked));
}

#[tokio::test]
async fn test_sixth_login_is_denied() {
    let (orch, _store) = orchestrator();

    for attempt in 1..=5 {
        let decision = orch
            .process_request(SecurityRequest::new("login", "alice@example.com"))
            .await;
        assert!(decision.allowed, "attempt {} should be allowed", attempt);
    }

    let sixth = orch
        .process_request(SecurityRequest::new("login", "alice@example.com"))
        .await;
    assert!(!sixth.allowed);
    assert_eq!(sixth.decision, Decision::Block);
    assert_eq!(sixth.risk_score, 100);
    assert!(sixth.threats.contains(&THREAT_RATE_LIMIT_EXCEEDED.to_string()));
    assert!(sixth.rate_limit.unwrap().retry_after_seconds.unwrap() > 0);

    // Another identifier is unaffected
    let other = orch.process_request(SecurityRequest::new("login", "bob@example.com")).await;
    assert!(other.allowed);
}

#[tokio::test]
async fn test_session_fingerprint_drift() {
    let (orch, _store) = orchestrator();
    let sessions = orch.sessions();
    let t0 = 1_700_000_000_000;
    let later = t0 + 10 * 60 * 1000;

    let home = compute_fingerprint(&desktop());
    assert!(!sessions.validate("same-device", &home, None, t0).await.anomaly_detected);
    assert!(!sessions.validate("same-device", &home, None, later).await.anomaly_detected);

    assert!(!sessions.validate("hijacked", &home, None, t0).await.anomaly_detected);
    let result = sessions
        .validate("hijacked", &compute_fingerprint(&phone()), None, later)
        .await;
    assert!(result.anomaly_detected);
    assert!(result.similarity.unwrap() < 0.7);
    assert!(result.severity.is_some());
}

#[tokio::test]
async fn test_invalidated_session_blocks_requests() {
    let (orch, _store) = orchestrator();
    let t0 = chrono::Utc::now().timestamp_millis() - 60 * 60 * 1000;

    let home = compute_fingerprint(&desktop());
    orch.sessions().validate("s-42", &home, None, t0).await;
    let hijack = orch
        .sessions()
        .validate("s-42", &compute_fingerprint(&phone()), None, t0 + 10 * 60 * 1000)
        .await;
    assert!(hijack.anomaly_detected);

    let decision = orch
        .process_request(
            SecurityRequest::new("api", "user-42")
                .with_input("hello")
                .with_session(SessionCheck {
                    session_id: "s-42".to_string(),
                    signals: Some(desktop()),
                    ..SessionCheck::default()
                }),
        )
        .await;

    assert!(decision.session.unwrap().anomaly_detected);
    assert!(decision.risk_score >= 50);
    assert_ne!(decision.decision, Decision::Allow);
}

#[tokio::test]
async fn test_registration_invalidates_cached_results() {
    let (orch, _store) = orchestrator();
    let engine = orch.rule_engine();

    let first = engine.validate("ticket", &json!("T-1"), None);
    assert!(first.is_valid);

    engine.register_rule(
        "ticket",
        ValidationRule::from_fn("ticket_format", 50, |value: &Value, _ctx: &ValidationContext| {
            if value.as_str().map(|s| s.starts_with("TKT-")).unwrap_or(false) {
                Ok(ValidationResult::valid())
            } else {
                Ok(ValidationResult::invalid("Ticket ids start with TKT-", Severity::Low))
            }
        }),
    );

    let second = engine.validate("ticket", &json!("T-1"), None);
    assert!(!second.is_valid);
}

#[tokio::test]
async fn test_sqlite_backed_pipeline() {
    let dir = TempDir::new().unwrap();
    let config = GuardConfig {
        store: StoreConfig {
            backend: StoreBackend::Sqlite,
            sqlite_path: dir.path().join("guard.db"),
        },
        ..GuardConfig::default()
    };

    let store = config.store.open().unwrap();
    let orch = SecurityOrchestrator::builder()
        .store(store)
        .config(config)
        .build()
        .unwrap();

    let decision = orch
        .process_request(
            SecurityRequest::new("form_submission", "ip:5.6.7.8")
                .with_input("../../etc/passwd")
                .with_context(ThreatContext::default().with_ip("5.6.7.8")),
        )
        .await;
    assert_eq!(decision.decision, Decision::Block);
    assert!(decision.threats.contains(&"path_traversal".to_string()));

    let status = orch.rate_limiter().status("ip:5.6.7.8", "form_submission").await.unwrap();
    assert_eq!(status.unwrap().attempt_count, 1);
}

#[tokio::test]
async fn test_metrics_track_decisions() {
    let (orch, _store) = orchestrator();

    orch.process_request(SecurityRequest::new("api", "m1").with_input("fine")).await;
    orch.process_request(
        SecurityRequest::new("api", "m2").with_input("<script>document.cookie</script>"),
    )
    .await;

    let metrics = orch.metrics().get_metrics().await;
    assert_eq!(metrics.requests_total, 2);
    assert_eq!(metrics.allowed_total, 1);
    assert_eq!(metrics.blocked_total, 1);
    assert_eq!(metrics.threats_detected_total, 1);
    assert_eq!(metrics.fail_secure_total, 0);
}
