// Behavioral signal scoring over the audit log.
//
// Two signals are derived from a user's recent security events:
// 1. Event diversity: many distinct event types in a short span suggests
//    probing rather than normal use
// 2. Failure bursts: repeated auth/validation/rate-limit failures within a
//    few minutes
//
// The analyzer is pure over the events handed to it; fetching them from the
// store (with a timeout) is the threat scorer's job.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::audit::{count_failures, SecurityEvent};

/// Thresholds for behavioral scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralConfig {
    /// Lookback for event diversity (ms)
    pub diversity_window_ms: i64,
    /// Distinct event types above which the high diversity score applies
    pub high_diversity_types: usize,
    /// Distinct event types above which the moderate diversity score applies
    pub moderate_diversity_types: usize,
    /// Lookback for failure bursts (ms)
    pub burst_window_ms: i64,
    /// Failures at or above which the high burst score applies
    pub high_burst_failures: usize,
    /// Failures at or above which the moderate burst score applies
    pub moderate_burst_failures: usize,
    /// Ceiling for the combined behavioral score
    pub max_score: u32,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            diversity_window_ms: 3_600_000, // 1 hour
            high_diversity_types: 5,
            moderate_diversity_types: 3,
            burst_window_ms: 300_000, // 5 minutes
            high_burst_failures: 5,
            moderate_burst_failures: 3,
            max_score: 50,
        }
    }
}

/// Behavioral analysis result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehavioralAnalysisResult {
    /// Combined score (0..=max_score)
    pub score: u32,
    pub distinct_event_types: usize,
    pub recent_failures: usize,
    pub anomalies: Vec<String>,
}

/// Behavioral analyzer
#[derive(Debug, Clone, Default)]
pub struct BehavioralAnalyzer {
    config: BehavioralConfig,
}

impl BehavioralAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BehavioralConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BehavioralConfig {
        &self.config
    }

    /// Score the events attributed to `user_id` as of `now_ms`
    pub fn analyze(&self, events: &[SecurityEvent], user_id: &str, now_ms: i64) -> BehavioralAnalysisResult {
        let diversity_since = now_ms - self.config.diversity_window_ms;
        let burst_since = now_ms - self.config.burst_window_ms;

        let own = events
            .iter()
            .filter(|e| e.actor.as_deref() == Some(user_id) && e.timestamp_ms <= now_ms);

        let mut types = HashSet::new();
        let mut burst = Vec::new();
        for event in own {
            if event.timestamp_ms >= diversity_since {
                types.insert(event.event_type);
            }
            if event.timestamp_ms >= burst_since {
                burst.push(event);
            }
        }
        let recent_failures = count_failures(burst);

        let mut anomalies = Vec::new();
        let mut score = 0;

        // Diversity (up to 20 points)
        if types.len() > self.config.high_diversity_types {
            score += 20;
            anomalies.push(format!("{} distinct event types in the last hour", types.len()));
        } else if types.len() > self.config.moderate_diversity_types {
            score += 10;
            anomalies.push(format!("{} distinct event types in the last hour", types.len()));
        }

        // Failure bursts (up to 30 points)
        if recent_failures >= self.config.high_burst_failures {
            score += 30;
            anomalies.push(format!("{} failures in the burst window", recent_failures));
        } else if recent_failures >= self.config.moderate_burst_failures {
            score += 15;
            anomalies.push(format!("{} failures in the burst window", recent_failures));
        }

        BehavioralAnalysisResult {
            score: score.min(self.config.max_score),
            distinct_event_types: types.len(),
            recent_failures,
            anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EventType;
    use crate::severity::Severity;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn event(kind: EventType, actor: &str, age_ms: i64) -> SecurityEvent {
        SecurityEvent::new(kind, Severity::Low, json!({}))
            .with_actor(actor)
            .at(NOW - age_ms)
    }

    #[test]
    fn test_quiet_user_scores_zero() {
        let analyzer = BehavioralAnalyzer::new();
        let events = vec![event(EventType::RequestProcessed, "alice", 1_000)];
        let result = analyzer.analyze(&events, "alice", NOW);
        assert_eq!(result.score, 0);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn test_failure_burst() {
        let analyzer = BehavioralAnalyzer::new();

        let three: Vec<_> = (0..3).map(|i| event(EventType::AuthFailure, "bob", i * 1_000)).collect();
        assert_eq!(analyzer.analyze(&three, "bob", NOW).score, 15);

        let five: Vec<_> = (0..5).map(|i| event(EventType::AuthFailure, "bob", i * 1_000)).collect();
        let result = analyzer.analyze(&five, "bob", NOW);
        assert_eq!(result.score, 30);
        assert_eq!(result.recent_failures, 5);
    }

    #[test]
    fn test_old_failures_and_other_users_ignored() {
        let analyzer = BehavioralAnalyzer::new();
        let mut events: Vec<_> = (0..5).map(|_| event(EventType::AuthFailure, "bob", 600_000)).collect();
        events.extend((0..5).map(|_| event(EventType::AuthFailure, "mallory", 1_000)));
        assert_eq!(analyzer.analyze(&events, "bob", NOW).score, 0);
    }

    fn spread(kinds: &[EventType], actor: &str) -> Vec<SecurityEvent> {
        // 200s apart so only the first two fall inside the burst window
        kinds
            .iter()
            .enumerate()
            .map(|(i, k)| event(*k, actor, i as i64 * 200_000))
            .collect()
    }

    #[test]
    fn test_moderate_event_diversity() {
        let analyzer = BehavioralAnalyzer::new();
        let events = spread(
            &[
                EventType::RequestProcessed,
                EventType::RequestFlagged,
                EventType::RequestProcessed,
                EventType::ThreatDetected,
                EventType::ValidationFailed,
            ],
            "carol",
        );

        let result = analyzer.analyze(&events, "carol", NOW);
        assert_eq!(result.distinct_event_types, 4);
        assert_eq!(result.recent_failures, 0);
        assert_eq!(result.score, 10);
    }

    #[test]
    fn test_high_event_diversity() {
        let analyzer = BehavioralAnalyzer::new();
        let events = spread(
            &[
                EventType::ThreatDetected,
                EventType::RequestProcessed,
                EventType::RequestFlagged,
                EventType::ValidationFailed,
                EventType::RateLimitExceeded,
                EventType::RequestBlocked,
                EventType::AuthFailure,
            ],
            "carol",
        );

        let result = analyzer.analyze(&events, "carol", NOW);
        assert_eq!(result.distinct_event_types, 7);
        assert_eq!(result.recent_failures, 0);
        assert_eq!(result.score, 20);
    }

    #[test]
    fn test_diversity_and_burst_reach_the_ceiling() {
        let analyzer = BehavioralAnalyzer::new();
        let mut events = spread(
            &[
                EventType::ThreatDetected,
                EventType::RequestProcessed,
                EventType::RequestFlagged,
                EventType::RequestBlocked,
                EventType::RateLimitExceeded,
                EventType::ValidationFailed,
            ],
            "erin",
        );
        events.extend((0..5).map(|i| event(EventType::AuthFailure, "erin", i * 1_000)));

        let result = analyzer.analyze(&events, "erin", NOW);
        assert_eq!(result.score, 50);
        assert_eq!(result.anomalies.len(), 2);
    }

    #[test]
    fn test_blocked_invalid_request_is_one_failure() {
        let analyzer = BehavioralAnalyzer::new();
        let tagged = |kind| {
            SecurityEvent::new(kind, Severity::High, json!({ "requestId": "req_9" }))
                .with_actor("frank")
                .at(NOW - 1_000)
        };
        let events = vec![
            tagged(EventType::ValidationFailed),
            tagged(EventType::RequestBlocked),
            event(EventType::AuthFailure, "frank", 2_000),
            event(EventType::AuthFailure, "frank", 3_000),
        ];

        let result = analyzer.analyze(&events, "frank", NOW);
        assert_eq!(result.recent_failures, 3);
        assert_eq!(result.score, 15);
    }

    #[test]
    fn test_score_capped() {
        let analyzer = BehavioralAnalyzer::with_config(BehavioralConfig {
            max_score: 20,
            ..BehavioralConfig::default()
        });
        let events: Vec<_> = (0..6).map(|_| event(EventType::AuthFailure, "dave", 0)).collect();
        assert_eq!(analyzer.analyze(&events, "dave", NOW).score, 20);
    }
}
