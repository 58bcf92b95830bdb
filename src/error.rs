use thiserror::Error;

/// Errors raised inside the guard pipeline.
///
/// Most of these never reach a caller of the orchestrator: each subsystem folds
/// its own failures into the risk fields of its result. They surface directly
/// from catalog loading, configuration and the data store adapters.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A validation rule failed while running
    #[error("Validation rule '{rule}' failed: {message}")]
    RuleFailure { rule: String, message: String },

    /// The rate-limit, session or audit store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A threat pattern was malformed or unsafe to load
    #[error("Pattern '{name}' rejected: {reason}")]
    PatternRejected { name: String, reason: String },

    /// Anything unexpected inside the orchestration sequence
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to acquire lock (poisoned): {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for GuardError {
    fn from(err: rusqlite::Error) -> Self {
        GuardError::StoreUnavailable(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for GuardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GuardError::LockPoisoned(err.to_string())
    }
}

impl GuardError {
    /// Build a rule failure from anything printable
    pub fn rule(rule: impl Into<String>, message: impl std::fmt::Display) -> Self {
        GuardError::RuleFailure {
            rule: rule.into(),
            message: message.to_string(),
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GuardError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
