use serde::{Deserialize, Serialize};
use std::fmt;

/// Threat severity shared by patterns, validation results and analyses.
///
/// Ordering is meaningful: `Low < Medium < High < Critical`, so the highest
/// severity of a set is simply `max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The one weight table. Every score in the crate is derived from it.
pub const SEVERITY_WEIGHTS: [(Severity, u32); 4] = [
    (Severity::Low, 10),
    (Severity::Medium, 25),
    (Severity::High, 50),
    (Severity::Critical, 100),
];

impl Severity {
    /// Numeric weight of this severity
    pub const fn weight(self) -> u32 {
        match self {
            Severity::Low => SEVERITY_WEIGHTS[0].1,
            Severity::Medium => SEVERITY_WEIGHTS[1].1,
            Severity::High => SEVERITY_WEIGHTS[2].1,
            Severity::Critical => SEVERITY_WEIGHTS[3].1,
        }
    }

    /// Classify an aggregate 0-100 risk score
    pub fn from_score(score: u32) -> Self {
        if score >= 75 {
            Severity::Critical
        } else if score >= 50 {
            Severity::High
        } else if score >= 25 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Low
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
