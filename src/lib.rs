// Library interface for the AEGIS guard components
// The binary in main.rs serves these over HTTP

pub mod audit;
pub mod behavior;
pub mod config;
pub mod error;
pub mod lock_utils;
pub mod metrics;
pub mod orchestrator;
pub mod patterns;
pub mod rate_limiter;
pub mod reputation;
pub mod rule_engine;
pub mod server;
pub mod session;
pub mod severity;
pub mod store;
pub mod threat_scorer;
pub mod validators;

pub use config::GuardConfig;
pub use error::{GuardError, Result};
pub use orchestrator::{Decision, SecurityDecision, SecurityOrchestrator, SecurityRequest};
pub use patterns::PatternCatalog;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use reputation::ThreatContext;
pub use rule_engine::{RuleEngine, ValidationResult, ValidationRule};
pub use session::SessionAnomalyDetector;
pub use severity::Severity;
pub use store::{DataStore, MemoryStore, SqliteStore};
pub use threat_scorer::{ThreatAnalysis, ThreatScorer};
