//! Prioritized validation rules per input type.
//!
//! Rules for one type run in descending priority order (registration order
//! breaks ties). Each rule sees the value left by the rules before it: a rule
//! that sanitizes replaces the running value, a rule that does not passes it
//! through unchanged. When several rules sanitize, the last one executed wins.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock_utils::{lock_or_recover, read_lock_or_recover, write_lock_or_recover};
use crate::severity::Severity;

/// Warning attached when a type has no registered rules
pub const NO_RULES_WARNING: &str = "No validation rules applied";

/// Outcome of validating one value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub risk_level: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_value: Option<Value>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            risk_level: Severity::Low,
            sanitized_value: None,
        }
    }

    pub fn invalid(error: impl Into<String>, risk_level: Severity) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
            risk_level,
            sanitized_value: None,
        }
    }

    /// Valid result carrying a replacement value
    pub fn sanitized(value: impl Into<Value>) -> Self {
        Self {
            sanitized_value: Some(value.into()),
            ..Self::valid()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_risk(mut self, risk_level: Severity) -> Self {
        self.risk_level = risk_level;
        self
    }
}

/// Caller-supplied context handed to every rule (free-form JSON)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationContext(pub Value);

impl ValidationContext {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// A single validation or sanitization step
pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value, context: &ValidationContext) -> Result<ValidationResult>;
}

impl<F> Validator for F
where
    F: Fn(&Value, &ValidationContext) -> Result<ValidationResult> + Send + Sync,
{
    fn validate(&self, value: &Value, context: &ValidationContext) -> Result<ValidationResult> {
        self(value, context)
    }
}

#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    /// Higher runs first
    pub priority: i32,
    pub validator: Arc<dyn Validator>,
}

impl ValidationRule {
    pub fn new(name: impl Into<String>, priority: i32, validator: impl Validator + 'static) -> Self {
        Self {
            name: name.into(),
            priority,
            validator: Arc::new(validator),
        }
    }

    /// Build a rule from a closure
    pub fn from_fn<F>(name: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: Fn(&Value, &ValidationContext) -> Result<ValidationResult> + Send + Sync + 'static,
    {
        Self::new(name, priority, f)
    }
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEngineConfig {
    /// Maximum cached results; 0 disables the cache
    pub cache_capacity: usize,
    /// Length limit used by the `general` rule set
    pub max_input_length: usize,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            max_input_length: 10_000,
        }
    }
}

/// (input type, serialized value, serialized context)
type CacheKey = (String, String, String);

/// Registry of validation rules keyed by input type
pub struct RuleEngine {
    rules: RwLock<HashMap<String, Vec<ValidationRule>>>,
    cache: Option<Mutex<LruCache<CacheKey, ValidationResult>>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(&RuleEngineConfig::default())
    }
}

impl RuleEngine {
    pub fn new(config: &RuleEngineConfig) -> Self {
        let cache = NonZeroUsize::new(config.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        info!(
            "Rule engine created (result cache: {})",
            if cache.is_some() { "enabled" } else { "disabled" }
        );
        Self {
            rules: RwLock::new(HashMap::new()),
            cache,
        }
    }

    /// Add a rule to `input_type`. Drops every cached result for that type.
    pub fn register_rule(&self, input_type: &str, rule: ValidationRule) {
        let mut rules = write_lock_or_recover(&self.rules, "rule table");
        debug!(
            "Registering rule '{}' (priority {}) for type '{}'",
            rule.name, rule.priority, input_type
        );
        let list = rules.entry(input_type.to_string()).or_default();
        list.push(rule);
        // sort_by is stable: equal priorities keep registration order
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.invalidate_type(input_type);
    }

    /// Remove a rule by name. Returns whether anything was removed.
    pub fn remove_rule(&self, input_type: &str, name: &str) -> bool {
        let mut rules = write_lock_or_recover(&self.rules, "rule table");
        let removed = match rules.get_mut(input_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r.name != name);
                before != list.len()
            }
            None => false,
        };
        if removed {
            if rules.get(input_type).map(Vec::is_empty).unwrap_or(false) {
                rules.remove(input_type);
            }
            self.invalidate_type(input_type);
        }
        removed
    }

    /// Rule names for a type, in execution order
    pub fn rule_names(&self, input_type: &str) -> Vec<String> {
        read_lock_or_recover(&self.rules, "rule table")
            .get(input_type)
            .map(|list| list.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = read_lock_or_recover(&self.rules, "rule table").keys().cloned().collect();
        types.sort();
        types
    }

    pub fn cached_results(&self) -> usize {
        self.cache
            .as_ref()
            .map(|c| lock_or_recover(c, "validation cache").len())
            .unwrap_or(0)
    }

    /// Run every rule registered for `input_type` against `value`.
    ///
    /// Never fails: a rule that errors or panics is recorded as an error entry
    /// and forces the result invalid with at least `High` risk.
    pub fn validate(&self, input_type: &str, value: &Value, context: Option<&ValidationContext>) -> ValidationResult {
        let default_context = ValidationContext::default();
        let context = context.unwrap_or(&default_context);

        // Held across evaluation and cache insert so a concurrent registration
        // cannot leave a result computed against the old rule set in the cache.
        let rules = read_lock_or_recover(&self.rules, "rule table");

        let list = match rules.get(input_type) {
            Some(list) if !list.is_empty() => list,
            _ => return ValidationResult::valid().with_warning(NO_RULES_WARNING),
        };

        let key = self.cache.as_ref().map(|_| {
            (
                input_type.to_string(),
                value.to_string(),
                context.0.to_string(),
            )
        });

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = lock_or_recover(cache, "validation cache").get(key) {
                return hit.clone();
            }
        }

        let result = run_rules(list, value, context);

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            lock_or_recover(cache, "validation cache").put(key, result.clone());
        }
        result
    }

    fn invalidate_type(&self, input_type: &str) {
        let Some(cache) = &self.cache else { return };
        let mut cache = lock_or_recover(cache, "validation cache");
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.0 == input_type)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        if !stale.is_empty() {
            debug!("Dropped {} cached results for type '{}'", stale.len(), input_type);
        }
    }
}

fn run_rules(rules: &[ValidationRule], value: &Value, context: &ValidationContext) -> ValidationResult {
    let mut result = ValidationResult::valid();
    let mut current = value.clone();

    for rule in rules {
        let outcome = catch_unwind(AssertUnwindSafe(|| rule.validator.validate(&current, context)));

        match outcome {
            Ok(Ok(step)) => {
                debug!("Rule '{}' -> valid={} risk={}", rule.name, step.is_valid, step.risk_level);
                result.is_valid &= step.is_valid;
                result.errors.extend(step.errors);
                result.warnings.extend(step.warnings);
                result.risk_level = result.risk_level.max(step.risk_level);
                if let Some(sanitized) = step.sanitized_value {
                    current = sanitized.clone();
                    result.sanitized_value = Some(sanitized);
                }
            }
            Ok(Err(e)) => {
                warn!("Rule '{}' failed: {}", rule.name, e);
                record_rule_failure(&mut result, &rule.name);
            }
            Err(_) => {
                warn!("Rule '{}' panicked", rule.name);
                record_rule_failure(&mut result, &rule.name);
            }
        }
    }

    result
}

fn record_rule_failure(result: &mut ValidationResult, rule_name: &str) {
    result.errors.push(format!("Validation error in rule: {}", rule_name));
    result.is_valid = false;
    result.risk_level = result.risk_level.max(Severity::High);
}
