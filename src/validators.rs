//! Built-in rule sets for common input types.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::patterns::PatternCatalog;
use crate::rule_engine::{RuleEngine, RuleEngineConfig, ValidationContext, ValidationResult, ValidationRule, Validator};
use crate::severity::Severity;

pub const TYPE_GENERAL: &str = "general";
pub const TYPE_EMAIL: &str = "email";
pub const TYPE_REPOSITORY_ID: &str = "repository_id";
pub const TYPE_USERNAME: &str = "username";
pub const TYPE_URL: &str = "url";
pub const TYPE_HTML: &str = "html";

const MAX_EMAIL_LENGTH: usize = 254;
const MAX_REPO_SEGMENT_LENGTH: usize = 100;

impl RuleEngine {
    /// Engine preloaded with every built-in rule set
    pub fn with_default_rules(config: &RuleEngineConfig, catalog: Arc<PatternCatalog>) -> Self {
        let engine = RuleEngine::new(config);
        install_default_rules(&engine, catalog, config);
        engine
    }
}

pub fn install_default_rules(engine: &RuleEngine, catalog: Arc<PatternCatalog>, config: &RuleEngineConfig) {
    let threats = ThreatPatternCheck::new(catalog);

    engine.register_rule(TYPE_GENERAL, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_GENERAL, ValidationRule::new("max_length", 90, MaxLength(config.max_input_length)));
    engine.register_rule(TYPE_GENERAL, ValidationRule::new("strip_control_chars", 80, strip_control_chars));
    engine.register_rule(TYPE_GENERAL, ValidationRule::new("trim", 70, trim));
    engine.register_rule(TYPE_GENERAL, ValidationRule::new("threat_patterns", 10, threats.clone()));

    engine.register_rule(TYPE_EMAIL, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_EMAIL, ValidationRule::new("normalize_email", 90, normalize_email));
    engine.register_rule(TYPE_EMAIL, ValidationRule::new("max_length", 80, MaxLength(MAX_EMAIL_LENGTH)));
    engine.register_rule(TYPE_EMAIL, ValidationRule::new("email_format", 70, email_format));

    engine.register_rule(TYPE_REPOSITORY_ID, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_REPOSITORY_ID, ValidationRule::new("trim", 90, trim));
    engine.register_rule(TYPE_REPOSITORY_ID, ValidationRule::new("repository_format", 80, repository_format));

    engine.register_rule(TYPE_USERNAME, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_USERNAME, ValidationRule::new("trim", 90, trim));
    engine.register_rule(TYPE_USERNAME, ValidationRule::new("username_format", 80, username_format));

    engine.register_rule(TYPE_URL, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_URL, ValidationRule::new("trim", 90, trim));
    engine.register_rule(TYPE_URL, ValidationRule::new("url_scheme", 80, url_scheme));

    engine.register_rule(TYPE_HTML, ValidationRule::new("require_string", 100, require_string));
    engine.register_rule(TYPE_HTML, ValidationRule::new("max_length", 90, MaxLength(config.max_input_length)));
    engine.register_rule(TYPE_HTML, ValidationRule::new("threat_patterns", 20, threats));
    // Escaping must run last so the threat check sees the raw markup
    engine.register_rule(TYPE_HTML, ValidationRule::new("html_escape", 0, html_escape));
}

// ============================================
// Shared rules
// ============================================

fn require_string(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    if value.is_string() {
        Ok(ValidationResult::valid())
    } else {
        Ok(ValidationResult::invalid("Value must be a string", Severity::Low))
    }
}

/// Character-count limit
pub struct MaxLength(pub usize);

impl Validator for MaxLength {
    fn validate(&self, value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
        let Some(s) = value.as_str() else {
            return Ok(ValidationResult::valid());
        };
        if s.chars().count() > self.0 {
            Ok(ValidationResult::invalid(
                format!("Input exceeds maximum length of {} characters", self.0),
                Severity::Medium,
            ))
        } else {
            Ok(ValidationResult::valid())
        }
    }
}

/// Removes control characters other than tab, CR and LF
fn strip_control_chars(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    if cleaned.len() == s.len() {
        return Ok(ValidationResult::valid());
    }
    Ok(ValidationResult::sanitized(cleaned).with_warning("Control characters removed"))
}

fn trim(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    match value.as_str() {
        Some(s) if s.trim().len() != s.len() => Ok(ValidationResult::sanitized(s.trim())),
        _ => Ok(ValidationResult::valid()),
    }
}

/// Screens a string against the threat catalog.
///
/// High and critical matches fail validation; lower ones only warn. The
/// result's risk is the highest matched severity either way.
#[derive(Clone)]
pub struct ThreatPatternCheck {
    catalog: Arc<PatternCatalog>,
}

impl ThreatPatternCheck {
    pub fn new(catalog: Arc<PatternCatalog>) -> Self {
        Self { catalog }
    }
}

impl Validator for ThreatPatternCheck {
    fn validate(&self, value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
        let Some(s) = value.as_str() else {
            return Ok(ValidationResult::valid());
        };

        let mut result = ValidationResult::valid();
        for pattern in self.catalog.matches(s) {
            let message = format!("Potential {} detected", pattern.category);
            if pattern.severity >= Severity::High {
                result.is_valid = false;
                if !result.errors.contains(&message) {
                    result.errors.push(message);
                }
            } else if !result.warnings.contains(&message) {
                result.warnings.push(message);
            }
            result.risk_level = result.risk_level.max(pattern.severity);
        }
        Ok(result)
    }
}

// ============================================
// Type-specific rules
// ============================================

fn normalize_email(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    match value.as_str() {
        Some(s) => {
            let normalized = s.trim().to_lowercase();
            if normalized == s {
                Ok(ValidationResult::valid())
            } else {
                Ok(ValidationResult::sanitized(normalized))
            }
        }
        None => Ok(ValidationResult::valid()),
    }
}

fn email_format(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    if is_valid_email(s) {
        Ok(ValidationResult::valid())
    } else {
        Ok(ValidationResult::invalid("Invalid email format", Severity::Low))
    }
}

pub fn is_valid_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    labels_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

fn repository_format(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    let valid_segment = |seg: &str| {
        !seg.is_empty()
            && seg.len() <= MAX_REPO_SEGMENT_LENGTH
            && !seg.starts_with('.')
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match s.split_once('/') {
        Some((owner, name)) if valid_segment(owner) && valid_segment(name) => Ok(ValidationResult::valid()),
        _ => Ok(ValidationResult::invalid(
            "Repository id must be in owner/name format",
            Severity::Low,
        )),
    }
}

fn username_format(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    let len = s.chars().count();
    if !(3..=32).contains(&len) {
        return Ok(ValidationResult::invalid(
            "Username must be between 3 and 32 characters",
            Severity::Low,
        ));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Ok(ValidationResult::invalid(
            "Username may only contain letters, digits, '_' and '-'",
            Severity::Low,
        ));
    }
    Ok(ValidationResult::valid())
}

fn url_scheme(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    let lower = s.to_ascii_lowercase();
    let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();

    if compact.starts_with("javascript:") || compact.starts_with("data:") || compact.starts_with("vbscript:") {
        return Ok(ValidationResult::invalid("Dangerous URL scheme", Severity::High));
    }

    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') && !rest.contains(char::is_whitespace) => {
            Ok(ValidationResult::valid())
        }
        Some(_) => Ok(ValidationResult::invalid("URL is missing a host", Severity::Low)),
        None => Ok(ValidationResult::invalid("Only http and https URLs are allowed", Severity::Medium)),
    }
}

fn html_escape(value: &Value, _ctx: &ValidationContext) -> Result<ValidationResult> {
    let Some(s) = value.as_str() else {
        return Ok(ValidationResult::valid());
    };
    let escaped = escape_html(s);
    if escaped == s {
        Ok(ValidationResult::valid())
    } else {
        Ok(ValidationResult::sanitized(escaped))
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> RuleEngine {
        RuleEngine::with_default_rules(&RuleEngineConfig::default(), PatternCatalog::builtin())
    }

    #[test]
    fn test_default_types_registered() {
        let engine = engine();
        assert_eq!(
            engine.types(),
            vec!["email", "general", "html", "repository_id", "url", "username"]
        );
        assert_eq!(
            engine.rule_names(TYPE_GENERAL),
            vec!["require_string", "max_length", "strip_control_chars", "trim", "threat_patterns"]
        );
    }

    #[test]
    fn test_general_clean_input() {
        let result = engine().validate(TYPE_GENERAL, &json!("  Hello, world!\u{0007} "), None);
        assert!(result.is_valid);
        assert_eq!(result.risk_level, Severity::Low);
        assert_eq!(result.sanitized_value, Some(json!("Hello, world!")));
        assert!(result.warnings.contains(&"Control characters removed".to_string()));
    }

    #[test]
    fn test_general_rejects_attacks() {
        let engine = engine();

        let sqli = engine.validate(TYPE_GENERAL, &json!("'; DROP TABLE users; --"), None);
        assert!(!sqli.is_valid);
        assert_eq!(sqli.risk_level, Severity::Critical);
        assert!(sqli.errors.contains(&"Potential sql_injection detected".to_string()));

        let xss = engine.validate(TYPE_GENERAL, &json!("<script>alert(1)</script>"), None);
        assert!(!xss.is_valid);
        assert!(xss.errors.contains(&"Potential xss detected".to_string()));
    }

    #[test]
    fn test_general_medium_match_only_warns() {
        let result = engine().validate(TYPE_GENERAL, &json!("run nmap against it"), None);
        assert!(result.is_valid);
        assert_eq!(result.risk_level, Severity::Medium);
        assert_eq!(result.warnings, vec!["Potential scanner detected".to_string()]);
    }

    #[test]
    fn test_general_length_and_type() {
        let engine = engine();
        let long = "a".repeat(10_001);
        let result = engine.validate(TYPE_GENERAL, &json!(long), None);
        assert!(!result.is_valid);
        assert_eq!(result.risk_level, Severity::Medium);

        let result = engine.validate(TYPE_GENERAL, &json!(42), None);
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["Value must be a string".to_string()]);
    }

    #[test]
    fn test_email() {
        let engine = engine();
        let result = engine.validate(TYPE_EMAIL, &json!("  Alice@Example.COM "), None);
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.sanitized_value, Some(json!("alice@example.com")));

        for bad in ["not-an-email", "a@b", "@example.com", "a@@example.com", "a b@example.com"] {
            assert!(!engine.validate(TYPE_EMAIL, &json!(bad), None).is_valid, "accepted {}", bad);
        }

        let long = format!("{}@example.com", "a".repeat(250));
        assert!(!engine.validate(TYPE_EMAIL, &json!(long), None).is_valid);
    }

    #[test]
    fn test_repository_id() {
        let engine = engine();
        assert!(engine.validate(TYPE_REPOSITORY_ID, &json!("octocat/hello-world"), None).is_valid);
        assert!(engine.validate(TYPE_REPOSITORY_ID, &json!("rust-lang/rust.vim"), None).is_valid);
        for bad in ["octocat", "octocat/", "/repo", "a/b/c", "../etc", "owner/.hidden"] {
            assert!(!engine.validate(TYPE_REPOSITORY_ID, &json!(bad), None).is_valid, "accepted {}", bad);
        }
    }

    #[test]
    fn test_username() {
        let engine = engine();
        assert!(engine.validate(TYPE_USERNAME, &json!("alice_01"), None).is_valid);
        assert!(!engine.validate(TYPE_USERNAME, &json!("al"), None).is_valid);
        assert!(!engine.validate(TYPE_USERNAME, &json!("alice smith"), None).is_valid);
        assert!(!engine.validate(TYPE_USERNAME, &json!("a".repeat(33)), None).is_valid);
    }

    #[test]
    fn test_url() {
        let engine = engine();
        assert!(engine.validate(TYPE_URL, &json!("https://example.com/path?q=1"), None).is_valid);

        let js = engine.validate(TYPE_URL, &json!("JavaScript:alert(1)"), None);
        assert!(!js.is_valid);
        assert_eq!(js.risk_level, Severity::High);

        assert!(!engine.validate(TYPE_URL, &json!("data:text/html;base64,AAAA"), None).is_valid);
        assert!(!engine.validate(TYPE_URL, &json!("ftp://example.com"), None).is_valid);
        assert!(!engine.validate(TYPE_URL, &json!("https://"), None).is_valid);
    }

    #[test]
    fn test_html_escapes_after_threat_check() {
        let engine = engine();
        let benign = engine.validate(TYPE_HTML, &json!("<b>bold</b> & \"quoted\""), None);
        assert!(benign.is_valid);
        assert_eq!(
            benign.sanitized_value,
            Some(json!("&lt;b&gt;bold&lt;&#x2F;b&gt; &amp; &quot;quoted&quot;"))
        );

        let hostile = engine.validate(TYPE_HTML, &json!("<script>alert(1)</script>"), None);
        assert!(!hostile.is_valid);
        assert_eq!(hostile.risk_level, Severity::Critical);
        assert!(hostile.sanitized_value.is_some());
    }
}
