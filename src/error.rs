//! Error types for the float engine.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Broad classification used when mapping an error onto a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect.
    Validation,
    /// Well-formed input that the engine refuses to act on.
    BusinessRule,
    /// Caller lacks the role required for the operation.
    Unauthorized,
    /// Store failure or anything else the caller cannot fix.
    Unexpected,
}

/// Errors that can occur during engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An amount that must be whole base units carried a fraction
    #[error("Amount {value} is not an integer in the base unit")]
    NonIntegerAmount { value: String },

    /// The pool handed to a share calculation was fractional
    #[error("Passed a non-integer pool: {value}")]
    NonIntegerPool { value: String },

    /// A share expressed as a fraction fell outside [0, 1]
    #[error("Share {value} is not in the range [0, 1]")]
    ShareOutOfRange { value: String },

    /// Apportionment weights must be non-negative
    #[error("Weight for entity {entity_id} is negative: {weight}")]
    NegativeWeight { entity_id: String, weight: i64 },

    /// Converting between units would lose precision
    #[error("Cannot express {amount} {from} in {to} without a remainder")]
    UnitConversion {
        amount: i64,
        from: String,
        to: String,
    },

    /// Fixed-point arithmetic left the representable range
    #[error("Arithmetic overflow while computing {context}")]
    Overflow { context: &'static str },

    /// Request failed structural validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A transfer instruction names a source the dispatcher cannot debit
    #[error("Cannot handle from type {from_type} in instruction {identifier}")]
    UnsupportedFromType {
        identifier: String,
        from_type: String,
    },

    /// A transfer instruction is well-formed but not actionable
    #[error("Instruction {identifier} rejected: {message}")]
    InvalidInstruction { identifier: String, message: String },

    /// No configuration exists for the float
    #[error("No configuration for float {float_id} of client {client_id}")]
    FloatNotConfigured { client_id: String, float_id: String },

    /// Caller role is not permitted to run the operation
    #[error("Role {role} is not authorized for {operation}")]
    Unauthorized { role: String, operation: &'static str },

    /// A ledger or config store call failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The idempotency cache could not be reached
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Audit export failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// A concurrent attempt with the same fingerprint failed while this one waited
    #[error("Prior attempt with the same fingerprint failed: {0}")]
    PriorAttemptFailed(String),

    /// Failed to open, read or write a file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reading or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Missing request file argument
    #[error("Missing request file argument. Usage: float-engine <request.json> [ledger.csv]")]
    MissingArgument,
}

impl EngineError {
    /// Classifies the error for status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NonIntegerAmount { .. }
            | EngineError::NonIntegerPool { .. }
            | EngineError::ShareOutOfRange { .. }
            | EngineError::NegativeWeight { .. }
            | EngineError::UnitConversion { .. }
            | EngineError::Overflow { .. }
            | EngineError::InvalidRequest(_) => ErrorKind::Validation,
            EngineError::UnsupportedFromType { .. }
            | EngineError::InvalidInstruction { .. }
            | EngineError::FloatNotConfigured { .. } => ErrorKind::BusinessRule,
            EngineError::Unauthorized { .. } => ErrorKind::Unauthorized,
            _ => ErrorKind::Unexpected,
        }
    }
}
