//! Threat signature catalog.
//!
//! Signatures follow the OWASP Top 10 / ModSecurity CRS families. The catalog
//! is immutable once built and shared behind an `Arc`, so matching needs no
//! locking. Every regex goes through [`compile_safe_regex`] at load time; a
//! pattern that fails screening rejects the whole catalog.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{GuardError, Result};
use crate::severity::Severity;

/// Maximum allowed regex pattern length
const MAX_REGEX_PATTERN_LENGTH: usize = 2048;

/// Fragments known to cause catastrophic backtracking in backtracking engines
const DANGEROUS_FRAGMENTS: [&str; 6] = [r"(\w+)+", r"(.*)*", r"(.*)+", r"(.+)+", r"(.+)*", r"([a-z]+)*"];

pub const CATEGORY_SQL_INJECTION: &str = "sql_injection";
pub const CATEGORY_XSS: &str = "xss";
pub const CATEGORY_COMMAND_INJECTION: &str = "command_injection";
pub const CATEGORY_PATH_TRAVERSAL: &str = "path_traversal";
pub const CATEGORY_LDAP_INJECTION: &str = "ldap_injection";
pub const CATEGORY_NOSQL_INJECTION: &str = "nosql_injection";
pub const CATEGORY_XXE: &str = "xxe";
pub const CATEGORY_TEMPLATE_INJECTION: &str = "template_injection";
pub const CATEGORY_SCANNER: &str = "scanner";

/// Compile a signature regex after screening it for ReDoS-prone structure.
///
/// The `regex` crate itself matches in linear time, but catalogs are also
/// exported to engines that backtrack, so unsafe shapes are refused here.
pub fn compile_safe_regex(pattern: &str) -> std::result::Result<Regex, String> {
    if pattern.len() > MAX_REGEX_PATTERN_LENGTH {
        return Err(format!(
            "pattern exceeds maximum length of {} characters",
            MAX_REGEX_PATTERN_LENGTH
        ));
    }

    for dangerous in &DANGEROUS_FRAGMENTS {
        if pattern.contains(dangerous) {
            return Err(format!("pattern contains dangerous nested quantifier: {}", dangerous));
        }
    }

    if has_nested_quantifier(pattern) {
        return Err("pattern repeats a group that already contains an unbounded quantifier".to_string());
    }

    regex::RegexBuilder::new(pattern)
        .size_limit(1024 * 1024)
        .dfa_size_limit(1024 * 1024)
        .build()
        .map_err(|e| format!("failed to compile regex: {}", e))
}

/// Detects `(...+...)+`-shaped constructs: an unboundedly repeated group whose
/// body already holds an unbounded quantifier.
fn has_nested_quantifier(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    // One flag per open group: does its body contain an unbounded quantifier?
    let mut groups: Vec<bool> = Vec::new();
    let mut in_class = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            i += 2;
            continue;
        }
        if in_class {
            if c == ']' {
                in_class = false;
            }
            i += 1;
            continue;
        }

        match c {
            '[' => {
                in_class = true;
                // A leading `]` (or `^]`) is a literal member of the class
                if chars.get(i + 1) == Some(&'^') {
                    i += 1;
                }
                if chars.get(i + 1) == Some(&']') {
                    i += 1;
                }
            }
            '(' => groups.push(false),
            ')' => {
                let inner_unbounded = groups.pop().unwrap_or(false);
                let repeated = is_unbounded_quantifier(&chars[i + 1..]);
                if inner_unbounded && repeated {
                    return true;
                }
                if inner_unbounded || repeated {
                    if let Some(parent) = groups.last_mut() {
                        *parent = true;
                    }
                }
            }
            '+' | '*' | '{' => {
                if is_unbounded_quantifier(&chars[i..]) {
                    if let Some(current) = groups.last_mut() {
                        *current = true;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    false
}

/// Whether `rest` starts with `+`, `*` or an open-ended `{n,}`
fn is_unbounded_quantifier(rest: &[char]) -> bool {
    match rest.first() {
        Some('+') | Some('*') => true,
        Some('{') => {
            let body: String = rest[1..].iter().take_while(|c| **c != '}').collect();
            body.ends_with(',') && body[..body.len() - 1].chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Serializable signature definition, as found in YAML catalogs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub name: String,
    pub category: String,
    pub pattern: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

impl PatternDefinition {
    fn new(name: &str, category: &str, severity: Severity, pattern: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            pattern: pattern.to_string(),
            severity,
            description: description.to_string(),
        }
    }
}

/// A compiled threat signature
#[derive(Debug, Clone)]
pub struct ThreatPattern {
    pub name: String,
    pub category: String,
    pub regex: Regex,
    pub severity: Severity,
    pub description: String,
}

impl ThreatPattern {
    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    pub fn weight(&self) -> u32 {
        self.severity.weight()
    }
}

/// Where the catalog comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSourceConfig {
    /// YAML catalog file; the built-in set is used alone when absent
    pub custom_file: Option<PathBuf>,
    /// Merge the custom file with the built-in signatures
    pub extend_builtin: bool,
}

impl Default for PatternSourceConfig {
    fn default() -> Self {
        Self {
            custom_file: None,
            extend_builtin: true,
        }
    }
}

/// Immutable registry of threat signatures
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    patterns: Vec<ThreatPattern>,
}

static BUILTIN: Lazy<Arc<PatternCatalog>> = Lazy::new(|| {
    let catalog = PatternCatalog::from_definitions(builtin_definitions())
        .expect("built-in threat patterns must pass screening");
    Arc::new(catalog)
});

impl PatternCatalog {
    /// Shared default catalog
    pub fn builtin() -> Arc<PatternCatalog> {
        BUILTIN.clone()
    }

    /// Compile and screen a set of definitions. Any rejected pattern or
    /// duplicate name fails the whole load.
    pub fn from_definitions(definitions: Vec<PatternDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut patterns = Vec::with_capacity(definitions.len());

        for def in definitions {
            if def.name.trim().is_empty() || def.category.trim().is_empty() {
                return Err(GuardError::PatternRejected {
                    name: def.name,
                    reason: "name and category are required".to_string(),
                });
            }
            if !seen.insert(def.name.clone()) {
                return Err(GuardError::PatternRejected {
                    name: def.name,
                    reason: "duplicate pattern name".to_string(),
                });
            }
            let regex = compile_safe_regex(&def.pattern).map_err(|reason| GuardError::PatternRejected {
                name: def.name.clone(),
                reason,
            })?;

            patterns.push(ThreatPattern {
                name: def.name,
                category: def.category,
                regex,
                severity: def.severity,
                description: def.description,
            });
        }

        Ok(Self { patterns })
    }

    /// Load definitions from a YAML list
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definitions: Vec<PatternDefinition> = serde_yaml::from_str(yaml)?;
        Self::from_definitions(definitions)
    }

    /// Load a YAML catalog file, optionally on top of the built-in signatures
    pub fn from_yaml_file(path: impl AsRef<Path>, extend_builtin: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut definitions: Vec<PatternDefinition> = serde_yaml::from_str(&contents)?;
        if extend_builtin {
            let mut merged = builtin_definitions();
            merged.append(&mut definitions);
            definitions = merged;
        }
        let catalog = Self::from_definitions(definitions)?;
        info!(
            "Loaded {} threat patterns from {:?}",
            catalog.len(),
            path.as_ref()
        );
        Ok(catalog)
    }

    /// Build the catalog described by `source`
    pub fn load(source: &PatternSourceConfig) -> Result<Arc<Self>> {
        match &source.custom_file {
            Some(path) => Ok(Arc::new(Self::from_yaml_file(path, source.extend_builtin)?)),
            None => Ok(Self::builtin()),
        }
    }

    /// All signatures matching `input`, in catalog order
    pub fn matches(&self, input: &str) -> Vec<&ThreatPattern> {
        self.patterns.iter().filter(|p| p.is_match(input)).collect()
    }

    /// Signatures of one category matching `input`
    pub fn scan_category(&self, input: &str, category: &str) -> Vec<&ThreatPattern> {
        self.patterns
            .iter()
            .filter(|p| p.category == category && p.is_match(input))
            .collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<&ThreatPattern> {
        self.patterns.iter().filter(|p| p.category == category).collect()
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.patterns
            .iter()
            .map(|p| p.category.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    pub fn patterns(&self) -> &[ThreatPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Default signature set
pub fn builtin_definitions() -> Vec<PatternDefinition> {
    use Severity::*;

    vec![
        // ============================================
        // SQL Injection
        // ============================================
        PatternDefinition::new(
            "sqli_keywords",
            CATEGORY_SQL_INJECTION,
            Critical,
            r"(?i)\b(union\s+(all\s+)?select|select\s+[\w*,\s]+\s+from|insert\s+into|delete\s+from|drop\s+(table|database)|truncate\s+table|alter\s+table|exec(ute)?\s+xp_)",
            "SQL statement keywords",
        ),
        PatternDefinition::new(
            "sqli_tautology",
            CATEGORY_SQL_INJECTION,
            High,
            r"(?i)'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+",
            "Boolean tautology after a quote",
        ),
        PatternDefinition::new(
            "sqli_terminator",
            CATEGORY_SQL_INJECTION,
            High,
            r"(?i)('\s*(--|#|;)|;\s*--|/\*.*\*/)",
            "Quote or statement terminated by comment",
        ),
        PatternDefinition::new(
            "sqli_time_based",
            CATEGORY_SQL_INJECTION,
            High,
            r"(?i)\b(sleep\s*\(\s*\d+\s*\)|benchmark\s*\(|waitfor\s+delay|pg_sleep)",
            "Time-based blind injection",
        ),
        // ============================================
        // Cross-Site Scripting
        // ============================================
        PatternDefinition::new(
            "xss_script_tag",
            CATEGORY_XSS,
            Critical,
            r"(?i)<\s*script[^>]*>",
            "Script tag injection",
        ),
        PatternDefinition::new(
            "xss_event_handler",
            CATEGORY_XSS,
            High,
            r"(?i)\bon(error|load|click|mouseover|focus|blur|submit|change)\s*=",
            "Inline event handler",
        ),
        PatternDefinition::new(
            "xss_script_uri",
            CATEGORY_XSS,
            High,
            r"(?i)\b(javascript|vbscript)\s*:",
            "Script protocol URI",
        ),
        PatternDefinition::new(
            "xss_embedded_content",
            CATEGORY_XSS,
            High,
            r"(?i)<\s*(iframe|object|embed|applet|base)\b",
            "Embedded active content",
        ),
        PatternDefinition::new(
            "xss_dom_sink",
            CATEGORY_XSS,
            Medium,
            r"(?i)(document\.(cookie|write)|window\.location|\beval\s*\(|innerHTML\s*=)",
            "DOM sink access",
        ),
        // ============================================
        // Command Injection
        // ============================================
        PatternDefinition::new(
            "cmd_shell_chain",
            CATEGORY_COMMAND_INJECTION,
            Critical,
            r"(?i)(;|&&|\|\|?)\s*(ls|cat|wget|curl|bash|sh|nc|netcat|rm|chmod|python|perl|whoami|id)\b",
            "Chained shell command",
        ),
        PatternDefinition::new(
            "cmd_substitution",
            CATEGORY_COMMAND_INJECTION,
            High,
            r"\$\([^)]*\)|`[^`]*`",
            "Shell command substitution",
        ),
        PatternDefinition::new(
            "cmd_windows",
            CATEGORY_COMMAND_INJECTION,
            Critical,
            r"(?i)\b(cmd\.exe|powershell(\.exe)?|wscript|cscript)\b",
            "Windows command interpreter",
        ),
        // ============================================
        // Path Traversal
        // ============================================
        PatternDefinition::new(
            "path_dot_dot",
            CATEGORY_PATH_TRAVERSAL,
            High,
            r"(?i)(\.\./|\.\.\\|%2e%2e(%2f|%5c))",
            "Parent directory traversal",
        ),
        PatternDefinition::new(
            "path_sensitive_file",
            CATEGORY_PATH_TRAVERSAL,
            Critical,
            r"(?i)(/etc/(passwd|shadow|hosts)|c:\\windows\\system32|/proc/self/)",
            "Sensitive system file access",
        ),
        // ============================================
        // Other injection families
        // ============================================
        PatternDefinition::new(
            "ldap_filter_injection",
            CATEGORY_LDAP_INJECTION,
            Medium,
            r"(\*\)\s*\(|\)\s*\(\s*[|&]|\(\s*[|&]\s*\()",
            "LDAP filter manipulation",
        ),
        PatternDefinition::new(
            "nosql_operator",
            CATEGORY_NOSQL_INJECTION,
            Medium,
            r#"(?i)(\$where|\$ne\b|\$gt\b|\$regex\b|\{\s*"\$[a-z]+")"#,
            "NoSQL query operator",
        ),
        PatternDefinition::new(
            "xxe_entity",
            CATEGORY_XXE,
            High,
            r#"(?i)(<!DOCTYPE[^>]*\[|<!ENTITY|SYSTEM\s+"(file|http))"#,
            "XML external entity declaration",
        ),
        PatternDefinition::new(
            "template_expression",
            CATEGORY_TEMPLATE_INJECTION,
            Medium,
            r"\{\{.*\}\}|\$\{.*\}|<%.*%>",
            "Server-side template expression",
        ),
        // ============================================
        // Scanner / tooling signatures
        // ============================================
        PatternDefinition::new(
            "scanner_signature",
            CATEGORY_SCANNER,
            Medium,
            r"(?i)\b(sqlmap|nikto|nmap|masscan|dirbuster|acunetix|nessus|burpsuite)\b",
            "Known security scanner",
        ),
    ]
}
