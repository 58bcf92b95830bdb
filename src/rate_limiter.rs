//! Per `(identifier, action)` attempt limiting with progressive lockout.
//!
//! Each key moves between three states:
//! - Open: attempts within the window, under the limit
//! - Blocked: limit exceeded, denied until `blocked_until_ms`
//! - WindowExpired: the window elapsed; the next attempt starts a new one
//!
//! Records live in the shared [`DataStore`] under `ratelimit:{action}:{identifier}`
//! and are updated with compare-and-swap, so concurrent attempts on one key
//! never lose an increment. Storage failures fail open.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};
use crate::lock_utils::lock_or_recover;
use crate::store::{DataStore, StoreFilter};

pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";

pub const ACTION_LOGIN: &str = "login";
pub const ACTION_SIGNUP: &str = "signup";
pub const ACTION_API: &str = "api";
pub const ACTION_FORM_SUBMISSION: &str = "form_submission";
pub const ACTION_PASSWORD_RESET: &str = "password_reset";
pub const ACTION_MFA_VERIFY: &str = "mfa_verify";

/// Limits for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    pub max_attempts: u32,
    pub window_secs: u64,
    /// Lockout for the first violation; later ones scale up from here
    pub block_secs: u64,
}

impl ActionPolicy {
    pub const fn new(max_attempts: u32, window_secs: u64, block_secs: u64) -> Self {
        Self {
            max_attempts,
            window_secs,
            block_secs,
        }
    }

    fn window_ms(&self) -> i64 {
        secs_to_ms(self.window_secs)
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::new(60, 60, 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Policy for actions without an entry in `actions`
    pub default: ActionPolicy,
    /// Per-action overrides, merged over the built-in table
    #[serde(deserialize_with = "merge_with_builtin_policies")]
    pub actions: HashMap<String, ActionPolicy>,
    /// Ceiling for the lockout multiplier
    pub max_block_multiplier: u32,
    /// Quiet period after which the violation count resets (seconds)
    pub violation_decay_secs: u64,
    /// Compare-and-swap attempts before failing open
    pub max_cas_retries: u32,
    /// Interval of the background sweep (seconds); 0 disables it
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: ActionPolicy::default(),
            actions: default_action_policies(),
            max_block_multiplier: 8,
            violation_decay_secs: 86_400,
            max_cas_retries: 8,
            sweep_interval_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self, action: &str) -> ActionPolicy {
        self.actions.get(action).copied().unwrap_or(self.default)
    }
}

/// Built-in per-action limits
pub fn default_action_policies() -> HashMap<String, ActionPolicy> {
    [
        // Credential endpoints - strict limits
        (ACTION_LOGIN, ActionPolicy::new(5, 900, 900)),
        (ACTION_MFA_VERIFY, ActionPolicy::new(5, 300, 900)),
        (ACTION_PASSWORD_RESET, ActionPolicy::new(3, 300, 900)),
        (ACTION_SIGNUP, ActionPolicy::new(3, 3600, 3600)),
        // Content and general traffic
        (ACTION_FORM_SUBMISSION, ActionPolicy::new(10, 60, 300)),
        (ACTION_API, ActionPolicy::new(100, 60, 60)),
    ]
    .into_iter()
    .map(|(action, policy)| (action.to_string(), policy))
    .collect()
}

fn merge_with_builtin_policies<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, ActionPolicy>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<String, ActionPolicy>::deserialize(deserializer)?;
    let mut policies = default_action_policies();
    policies.extend(overrides);
    Ok(policies)
}

/// Persisted state of one `(identifier, action)` key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub identifier: String,
    pub action: String,
    pub attempt_count: u32,
    pub window_start_ms: i64,
    pub blocked_until_ms: Option<i64>,
    #[serde(default)]
    pub violation_count: u32,
    #[serde(default)]
    pub last_violation_ms: Option<i64>,
}

impl RateLimitRecord {
    pub fn is_blocked(&self, now_ms: i64) -> bool {
        self.blocked_until_ms.map(|until| now_ms < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub remaining: u32,
    /// When the current window or lockout ends (ms since epoch)
    pub reset_time_ms: i64,
    pub attempt_count: u32,
}

/// Store key for one `(identifier, action)` pair. The action is length
/// prefixed so a ':' in either part cannot make two pairs share a key.
pub fn record_key(action: &str, identifier: &str) -> String {
    format!("{}{}:{}:{}", RATE_LIMIT_PREFIX, action.len(), action, identifier)
}

/// Seconds to milliseconds, saturating at `i64::MAX`
fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .unwrap_or(i64::MAX)
}

fn ceil_secs(ms: i64) -> u64 {
    (ms.max(0).saturating_add(999) / 1000) as u64
}

pub struct RateLimiter {
    store: Arc<dyn DataStore>,
    config: RateLimitConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn DataStore>, config: RateLimitConfig) -> Self {
        info!(
            "Rate limiter created ({} action policies, max multiplier {}x)",
            config.actions.len(),
            config.max_block_multiplier
        );
        Self {
            store,
            config,
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check_and_record(&self, identifier: &str, action: &str) -> RateLimitDecision {
        self.check_and_record_at(identifier, action, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Record one attempt at `now_ms` and decide whether it is allowed
    pub async fn check_and_record_at(&self, identifier: &str, action: &str, now_ms: i64) -> RateLimitDecision {
        let policy = self.config.policy(action);
        match self.try_check_and_record(identifier, action, policy, now_ms).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        "Rate limit denied {} for {} (retry after {:?}s)",
                        action, identifier, decision.retry_after_seconds
                    );
                }
                decision
            }
            Err(e) => {
                warn!("Rate limit store failure for {}:{}, failing open: {}", action, identifier, e);
                RateLimitDecision {
                    allowed: true,
                    retry_after_seconds: None,
                    remaining: policy.max_attempts,
                    reset_time_ms: now_ms.saturating_add(policy.window_ms()),
                    attempt_count: 0,
                }
            }
        }
    }

    async fn try_check_and_record(
        &self,
        identifier: &str,
        action: &str,
        policy: ActionPolicy,
        now_ms: i64,
    ) -> Result<RateLimitDecision> {
        let key = record_key(action, identifier);

        for attempt in 0..self.config.max_cas_retries.max(1) {
            let current = self.store.get(&key).await?;
            let record = current.as_ref().and_then(|value| parse_record(&key, value));

            let (next, decision) = self.transition(record.as_ref(), identifier, action, policy, now_ms);
            let Some(next) = next else {
                return Ok(decision);
            };

            if self
                .store
                .compare_and_swap(&key, current.as_ref(), serde_json::to_value(&next)?)
                .await?
            {
                return Ok(decision);
            }
            debug!("CAS contention on {} (attempt {})", key, attempt + 1);
        }

        Err(GuardError::StoreUnavailable(format!(
            "compare-and-swap retries exhausted for {}",
            key
        )))
    }

    /// Next record (None when nothing changes) and the decision for this attempt
    fn transition(
        &self,
        record: Option<&RateLimitRecord>,
        identifier: &str,
        action: &str,
        policy: ActionPolicy,
        now_ms: i64,
    ) -> (Option<RateLimitRecord>, RateLimitDecision) {
        let window_ms = policy.window_ms();

        let record = match record {
            None => {
                let fresh = RateLimitRecord {
                    identifier: identifier.to_string(),
                    action: action.to_string(),
                    attempt_count: 1,
                    window_start_ms: now_ms,
                    blocked_until_ms: None,
                    violation_count: 0,
                    last_violation_ms: None,
                };
                return (Some(fresh), allowed(policy, 1, now_ms.saturating_add(window_ms)));
            }
            Some(record) => record,
        };

        // Blocked
        if let Some(until) = record.blocked_until_ms.filter(|until| now_ms < *until) {
            let decision = RateLimitDecision {
                allowed: false,
                retry_after_seconds: Some(ceil_secs(until - now_ms)),
                remaining: 0,
                reset_time_ms: until,
                attempt_count: record.attempt_count,
            };
            return (None, decision);
        }

        let mut next = record.clone();
        if self.violations_decayed(record, now_ms) {
            next.violation_count = 0;
            next.last_violation_ms = None;
        }

        // WindowExpired
        if now_ms.saturating_sub(record.window_start_ms) >= window_ms {
            next.attempt_count = 1;
            next.window_start_ms = now_ms;
            next.blocked_until_ms = None;
            return (Some(next), allowed(policy, 1, now_ms.saturating_add(window_ms)));
        }

        // Open
        next.attempt_count = record.attempt_count.saturating_add(1);
        if next.attempt_count > policy.max_attempts {
            next.violation_count = next.violation_count.saturating_add(1);
            let block_ms = self.block_duration_ms(policy, next.violation_count);
            let until = now_ms.saturating_add(block_ms);
            next.blocked_until_ms = Some(until);
            next.last_violation_ms = Some(now_ms);

            warn!(
                "Rate limit exceeded: {} for {} (violation #{}, blocked {}s)",
                action,
                identifier,
                next.violation_count,
                block_ms / 1000
            );

            let decision = RateLimitDecision {
                allowed: false,
                retry_after_seconds: Some(ceil_secs(block_ms)),
                remaining: 0,
                reset_time_ms: until,
                attempt_count: next.attempt_count,
            };
            return (Some(next), decision);
        }

        let reset = record.window_start_ms.saturating_add(window_ms);
        let decision = allowed(policy, next.attempt_count, reset);
        (Some(next), decision)
    }

    fn violations_decayed(&self, record: &RateLimitRecord, now_ms: i64) -> bool {
        let decay_ms = secs_to_ms(self.config.violation_decay_secs);
        record
            .last_violation_ms
            .map(|last| now_ms.saturating_sub(last) >= decay_ms)
            .unwrap_or(false)
    }

    /// `base * min(2^(violations - 1), max_multiplier)`
    pub fn block_duration_ms(&self, policy: ActionPolicy, violations: u32) -> i64 {
        let cap = u64::from(self.config.max_block_multiplier.max(1));
        let exponent = violations.saturating_sub(1);
        let multiplier = if exponent >= 63 { cap } else { (1u64 << exponent).min(cap) };
        secs_to_ms(policy.block_secs.saturating_mul(multiplier))
    }

    /// Current record for a key, without recording an attempt
    pub async fn status(&self, identifier: &str, action: &str) -> Result<Option<RateLimitRecord>> {
        let key = record_key(action, identifier);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|value| parse_record(&key, &value)))
    }

    /// Administrative unlock: forget all state for a key
    pub async fn reset(&self, identifier: &str, action: &str) -> Result<()> {
        info!("Resetting rate limit for {}:{}", action, identifier);
        self.store.delete(&record_key(action, identifier)).await
    }

    /// Delete records that no longer influence any decision. Returns how many
    /// were removed.
    pub async fn sweep(&self, now_ms: i64) -> Result<usize> {
        let rows = self.store.query(&StoreFilter::prefix(RATE_LIMIT_PREFIX)).await?;
        let mut removed = 0;

        for (key, value) in rows {
            let dead = match parse_record(&key, &value) {
                Some(record) => {
                    let policy = self.config.policy(&record.action);
                    !record.is_blocked(now_ms)
                        && now_ms.saturating_sub(record.window_start_ms) >= policy.window_ms()
                        && (record.violation_count == 0 || self.violations_decayed(&record, now_ms))
                }
                None => true,
            };
            if dead {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Rate limit sweep removed {} expired records", removed);
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until stopped or the
    /// limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let limiter = Arc::downgrade(self);
        info!("Starting rate limit sweeper (interval: {:?})", interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else { break };
                if let Err(e) = limiter.sweep(chrono::Utc::now().timestamp_millis()).await {
                    warn!("Rate limit sweep failed: {}", e);
                }
            }
        });

        if let Some(previous) = lock_or_recover(&self.sweeper, "sweeper handle").replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = lock_or_recover(&self.sweeper, "sweeper handle").take() {
            handle.abort();
            info!("Rate limit sweeper stopped");
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn allowed(policy: ActionPolicy, attempt_count: u32, reset_time_ms: i64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        retry_after_seconds: None,
        remaining: policy.max_attempts.saturating_sub(attempt_count),
        reset_time_ms,
        attempt_count,
    }
}

fn parse_record(key: &str, value: &Value) -> Option<RateLimitRecord> {
    match serde_json::from_value(value.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Discarding unreadable rate limit record {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const T0: i64 = 1_700_000_000_000;

    fn limiter_with(config: RateLimitConfig) -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), RateLimiter::new(store, config))
    }

    fn limiter() -> (Arc<MemoryStore>, RateLimiter) {
        limiter_with(RateLimitConfig::default())
    }

    fn strict(max_attempts: u32, window_secs: u64, block_secs: u64) -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config
            .actions
            .insert("test".to_string(), ActionPolicy::new(max_attempts, window_secs, block_secs));
        config
    }

    #[tokio::test]
    async fn test_sixth_login_denied() {
        let (_, limiter) = limiter();

        for i in 1..=5u32 {
            let d = limiter.check_and_record_at("alice", ACTION_LOGIN, T0 + i as i64).await;
            assert!(d.allowed, "attempt {} should be allowed", i);
            assert_eq!(d.remaining, 5 - i);
            assert_eq!(d.attempt_count, i);
        }

        let denied = limiter.check_and_record_at("alice", ACTION_LOGIN, T0 + 6).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(900));
        assert_eq!(denied.remaining, 0);

        // Still blocked a minute later
        let later = limiter.check_and_record_at("alice", ACTION_LOGIN, T0 + 60_006).await;
        assert!(!later.allowed);
        assert_eq!(later.retry_after_seconds, Some(840));
    }

    #[tokio::test]
    async fn test_window_reset() {
        let (_, limiter) = limiter_with(strict(5, 60, 60));
        for i in 0..3 {
            limiter.check_and_record_at("bob", "test", T0 + i).await;
        }

        let d = limiter.check_and_record_at("bob", "test", T0 + 60_000).await;
        assert!(d.allowed);
        assert_eq!(d.attempt_count, 1);
        assert_eq!(d.remaining, 4);
        assert_eq!(d.reset_time_ms, T0 + 120_000);

        let record = limiter.status("bob", "test").await.unwrap().unwrap();
        assert_eq!(record.window_start_ms, T0 + 60_000);
        assert!(record.blocked_until_ms.is_none());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, limiter) = limiter_with(strict(1, 60, 60));
        assert!(limiter.check_and_record_at("a", "test", T0).await.allowed);
        assert!(!limiter.check_and_record_at("a", "test", T0 + 1).await.allowed);
        assert!(limiter.check_and_record_at("b", "test", T0 + 2).await.allowed);
        assert!(limiter.check_and_record_at("a", ACTION_API, T0 + 3).await.allowed);
    }

    #[tokio::test]
    async fn test_colons_cannot_alias_keys() {
        let (_, limiter) = limiter();
        assert_ne!(record_key(ACTION_LOGIN, "ip:1.2.3.4"), record_key("login:ip", "1.2.3.4"));

        for _ in 0..5 {
            assert!(limiter.check_and_record_at("ip:1.2.3.4", ACTION_LOGIN, T0).await.allowed);
        }
        assert!(!limiter.check_and_record_at("ip:1.2.3.4", ACTION_LOGIN, T0).await.allowed);

        let other = limiter.check_and_record_at("1.2.3.4", "login:ip", T0 + 61_000).await;
        assert!(other.allowed);
        assert_eq!(other.attempt_count, 1);
        assert!(limiter.status("1.2.3.4", "login:ip").await.unwrap().is_some());
        assert_eq!(
            limiter.status("ip:1.2.3.4", ACTION_LOGIN).await.unwrap().unwrap().attempt_count,
            6
        );
    }

    #[tokio::test]
    async fn test_huge_durations_saturate() {
        let (_, limiter) = limiter_with(strict(1, u64::MAX, u64::MAX));
        assert_eq!(limiter.block_duration_ms(ActionPolicy::new(1, u64::MAX, u64::MAX), 3), i64::MAX);

        let first = limiter.check_and_record_at("big", "test", T0).await;
        assert!(first.allowed);
        assert_eq!(first.reset_time_ms, i64::MAX);

        let denied = limiter.check_and_record_at("big", "test", T0 + 1).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_time_ms, i64::MAX);
        assert!(denied.retry_after_seconds.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_progressive_lockout_doubles_and_caps() {
        let (_, limiter) = limiter_with(strict(2, 86_400, 60));
        let mut now = T0;
        limiter.check_and_record_at("eve", "test", now).await;
        limiter.check_and_record_at("eve", "test", now).await;

        let mut observed = Vec::new();
        for _ in 0..6 {
            let d = limiter.check_and_record_at("eve", "test", now).await;
            assert!(!d.allowed);
            let retry = d.retry_after_seconds.unwrap();
            observed.push(retry);
            now += retry as i64 * 1000;
        }

        assert_eq!(observed, vec![60, 120, 240, 480, 480, 480]);
        let record = limiter.status("eve", "test").await.unwrap().unwrap();
        assert_eq!(record.violation_count, 6);
    }

    #[tokio::test]
    async fn test_violations_decay() {
        let mut config = strict(1, 60, 60);
        config.violation_decay_secs = 3600;
        let (_, limiter) = limiter_with(config);

        limiter.check_and_record_at("carl", "test", T0).await;
        let first = limiter.check_and_record_at("carl", "test", T0 + 1).await;
        assert_eq!(first.retry_after_seconds, Some(60));

        // Quiet for longer than the decay period
        let later = T0 + 2 * 3_600_000;
        assert!(limiter.check_and_record_at("carl", "test", later).await.allowed);
        let again = limiter.check_and_record_at("carl", "test", later + 1).await;
        assert_eq!(again.retry_after_seconds, Some(60));
    }

    #[test]
    fn test_block_duration_formula() {
        let (_, limiter) = limiter();
        let policy = ActionPolicy::new(5, 60, 10);
        assert_eq!(limiter.block_duration_ms(policy, 1), 10_000);
        assert_eq!(limiter.block_duration_ms(policy, 2), 20_000);
        assert_eq!(limiter.block_duration_ms(policy, 4), 80_000);
        assert_eq!(limiter.block_duration_ms(policy, 5), 80_000);
        assert_eq!(limiter.block_duration_ms(policy, 200), 80_000);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let (store, limiter) = limiter_with(strict(1, 60, 60));
        store.set_available(false);
        for _ in 0..5 {
            let d = limiter.check_and_record_at("x", "test", T0).await;
            assert!(d.allowed);
            assert_eq!(d.retry_after_seconds, None);
        }
    }

    #[tokio::test]
    async fn test_unknown_action_uses_default_policy() {
        let (_, limiter) = limiter();
        let d = limiter.check_and_record_at("x", "export_report", T0).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, ActionPolicy::default().max_attempts - 1);
    }

    #[tokio::test]
    async fn test_reset_unlocks() {
        let (_, limiter) = limiter_with(strict(1, 60, 600));
        limiter.check_and_record_at("y", "test", T0).await;
        assert!(!limiter.check_and_record_at("y", "test", T0 + 1).await.allowed);

        limiter.reset("y", "test").await.unwrap();
        assert!(limiter.status("y", "test").await.unwrap().is_none());
        assert!(limiter.check_and_record_at("y", "test", T0 + 2).await.allowed);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_dead_records() {
        let (store, limiter) = limiter_with(strict(1, 60, 600));

        // Expired window, never violated
        limiter.check_and_record_at("idle", "test", T0).await;
        // Still blocked at sweep time
        limiter.check_and_record_at("locked", "test", T0 + 50_000).await;
        limiter.check_and_record_at("locked", "test", T0 + 50_001).await;
        // Window still open
        limiter.check_and_record_at("fresh", "test", T0 + 100_000).await;

        let removed = limiter.sweep(T0 + 120_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
        assert!(limiter.status("idle", "test").await.unwrap().is_none());
        assert!(limiter.status("locked", "test").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_attempts_are_all_counted() {
        let store = Arc::new(MemoryStore::new());
        let mut config = strict(1_000, 3600, 60);
        config.max_cas_retries = 1_000;
        let limiter = Arc::new(RateLimiter::new(store, config));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.check_and_record_at("shared", "test", T0).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = limiter.status("shared", "test").await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 100);
    }

    #[tokio::test]
    async fn test_decision_serializes_camel_case() {
        let (_, limiter) = limiter();
        let d = limiter.check_and_record_at("z", ACTION_LOGIN, T0).await;
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"], 4);
        assert!(json.get("resetTimeMs").is_some());
        assert!(json.get("retryAfterSeconds").is_none());
    }

    mod proptest_lockout {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_block_duration_monotonic_and_capped(
                block_secs in 1u64..100_000,
                cap in 1u32..64,
                violations in 1u32..200,
            ) {
                let config = RateLimitConfig {
                    max_block_multiplier: cap,
                    ..RateLimitConfig::default()
                };
                let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), config);
                let policy = ActionPolicy::new(5, 60, block_secs);

                let current = limiter.block_duration_ms(policy, violations);
                let next = limiter.block_duration_ms(policy, violations + 1);
                prop_assert!(next >= current);
                prop_assert!(current >= (block_secs * 1000) as i64);
                prop_assert!(current <= (block_secs * 1000 * u64::from(cap)) as i64);
            }
        }
    }
}
