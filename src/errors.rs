//! Typed error hierarchy for the promptforge engine.
//!
//! - `ValidationError`: malformed playbook graphs, rejected before a run starts
//! - `ProviderError`: a single provider invocation, classified for retry
//! - `EngineError`: failures of a run, a stage advance, or a service call
//!
//! A failing quality gate is not an error; it is returned as
//! `AdvanceOutcome::Blocked`.

use thiserror::Error;

/// Errors found while validating a playbook's step graph.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Playbook has no steps")]
    Empty,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' references unknown step '{target}'")]
    UnknownStep { step: String, target: String },

    #[error("Start step '{0}' does not exist")]
    MissingStart(String),

    #[error("Cycle detected outside of a loop step. Involved steps: {0:?}")]
    Cycle(Vec<String>),

    #[error("Condition step '{step}' must branch to exactly two distinct steps: {message}")]
    AmbiguousBranch { step: String, message: String },

    #[error("Loop step '{step}' is invalid: {message}")]
    InvalidLoop { step: String, message: String },

    #[error("Step '{step}' crosses a loop boundary to '{target}'")]
    LoopBoundary { step: String, target: String },

    #[error("Human input step '{0}' cannot be placed inside a loop body")]
    HumanInputInLoop(String),

    #[error("Invalid expression in step '{step}': {message}")]
    InvalidExpression { step: String, message: String },

    #[error("Step '{step}' has invalid config: {message}")]
    InvalidConfig { step: String, message: String },
}

/// Errors from a single provider invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Transient provider failure from {provider}: {message}")]
    Transient {
        provider: String,
        message: String,
        status_code: Option<u16>,
    },

    #[error("Provider {provider} rejected credentials: {message}")]
    Auth { provider: String, message: String },

    #[error("Provider {provider} rejected request: {message}")]
    BadRequest { provider: String, message: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Budget exceeded for {scope}: spent {spent:.4} of cap {cap:.4}")]
    BudgetExceeded { scope: String, spent: f64, cap: f64 },

    #[error("Provider {provider} returned malformed response: {message}")]
    Malformed { provider: String, message: String },

    #[error("Consensus quorum not met: {succeeded} of {required} required providers succeeded ({})", .failures.join("; "))]
    QuorumNotMet {
        required: usize,
        succeeded: usize,
        failures: Vec<String>,
    },
}

impl ProviderError {
    /// Whether the gateway may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }

    /// Classify an HTTP status code returned by a provider.
    pub fn from_status(provider: &str, status: u16, message: String) -> Self {
        let provider = provider.to_string();
        match status {
            401 | 403 => Self::Auth { provider, message },
            408 | 429 | 500..=599 => Self::Transient {
                provider,
                message,
                status_code: Some(status),
            },
            _ => Self::BadRequest { provider, message },
        }
    }
}

/// Errors from the execution engine, the stage pipeline, and the services.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Step {step} failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("Budget exceeded for {scope}: spent {spent:.4} of cap {cap:.4}")]
    BudgetExceeded { scope: String, spent: f64, cap: f64 },

    #[error("Concurrent update on {entity}: expected version {expected}, found {found}")]
    ConcurrencyConflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Caller {user} may not access {kind} {id}")]
    Forbidden {
        user: String,
        kind: &'static str,
        id: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    #[error("Human input for step {step} timed out; run cancelled")]
    InputTimeout { step: String },

    #[error("Store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Wrap a provider failure raised while executing `step`.
    pub fn from_provider(step: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::BudgetExceeded { scope, spent, cap } => {
                Self::BudgetExceeded { scope, spent, cap }
            }
            other => Self::StepExecution {
                step: step.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Short machine-readable kind, recorded on execution errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::Cancelled(_) | Self::InputTimeout { .. } => ErrorKind::Cancelled,
            _ => ErrorKind::StepExecution,
        }
    }
}

/// Serializable error category stored on `PlaybookExecution::errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StepExecution,
    BudgetExceeded,
    ConcurrencyConflict,
    Cancelled,
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(format!("{:#}", err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_classification() {
        assert!(ProviderError::from_status("p", 503, "down".into()).is_transient());
        assert!(ProviderError::from_status("p", 429, "slow".into()).is_transient());
        assert!(matches!(
            ProviderError::from_status("p", 401, "nope".into()),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("p", 422, "bad".into()),
            ProviderError::BadRequest { .. }
        ));
        assert!(!ProviderError::from_status("p", 400, "bad".into()).is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        let err = ProviderError::Timeout {
            provider: "openai".into(),
            timeout_ms: 100,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn budget_error_keeps_distinct_kind() {
        let err = EngineError::from_provider(
            "B",
            ProviderError::BudgetExceeded {
                scope: "run".into(),
                spent: 1.5,
                cap: 1.0,
            },
        );
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));
    }

    #[test]
    fn provider_failure_becomes_step_execution() {
        let err = EngineError::from_provider(
            "B",
            ProviderError::Auth {
                provider: "p".into(),
                message: "bad key".into(),
            },
        );
        match &err {
            EngineError::StepExecution { step, message } => {
                assert_eq!(step, "B");
                assert!(message.contains("bad key"));
            }
            _ => panic!("Expected StepExecution"),
        }
        assert_eq!(err.kind(), ErrorKind::StepExecution);
    }

    #[test]
    fn validation_converts_into_engine_error() {
        let err: EngineError = ValidationError::DuplicateStep("A".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("Duplicate step id: A"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ValidationError::Empty);
        assert_std_error(&ProviderError::UnknownProvider("x".into()));
        assert_std_error(&EngineError::InvalidState("x".into()));
    }
}
