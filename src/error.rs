//! Error types for the mediation engine

use thiserror::Error;

/// Result type for mediation operations
pub type MediatorResult<T> = Result<T, MediatorError>;

/// Error taxonomy for the mediation engine.
///
/// Transient external failures are retried with backoff; terminal external
/// failures surface to the caller and the offending item is skipped for the
/// cycle. Everything else is classified so loop boundaries can decide whether
/// to log-and-continue or abort startup.
#[derive(Error, Debug)]
pub enum MediatorError {
    /// Ledger timeout, connection failure or 5xx
    #[error("transient chain failure: {0}")]
    ChainTransient(String),

    /// Ledger 4xx or otherwise unrecoverable response
    #[error("terminal chain failure: {0}")]
    ChainTerminal(String),

    /// Response did not match the expected schema
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// Circuit breaker is open, request rejected without dialing
    #[error("chain circuit breaker is open")]
    CircuitOpen,

    /// LLM or embedding backend timeout, connection failure or 5xx
    #[error("llm backend unavailable: {0}")]
    LlmUnavailable(String),

    /// LLM backend rejected the request outright
    #[error("llm request failed: {0}")]
    Llm(String),

    /// Oversize or malformed intent; the intent is dropped from candidacy
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// Prompt-injection pattern detected in user text
    #[error("prompt injection detected: {0}")]
    InjectionDetected(String),

    /// Embedding dimension does not match the index dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A non-terminal settlement already exists for the pair
    #[error("duplicate settlement for pair {0}")]
    DuplicateSettlement(String),

    /// Settlement id not known to the tracker
    #[error("settlement {0} not found")]
    SettlementNotFound(String),

    /// Invalid settlement state transition
    #[error("invalid settlement transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Index or reputation file persistence failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Mediator key material unusable; fatal at startup
    #[error("signing error: {0}")]
    Signing(String),

    /// Invariant violation; the operation is aborted, the loop continues
    #[error("internal error: {0}")]
    Internal(String),
}

impl MediatorError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MediatorError::ChainTransient(_) | MediatorError::LlmUnavailable(_)
        )
    }

    /// Fatal errors abort startup; everything else is survivable at a loop
    /// boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MediatorError::Signing(_) | MediatorError::Config(_)
        )
    }
}

impl From<std::io::Error> for MediatorError {
    fn from(err: std::io::Error) -> Self {
        MediatorError::Persistence(err.to_string())
    }
}
