//! Error taxonomy shared by the whole crate.
//!
//! Functions return `anyhow::Result`, the typed variant can be recovered
//! with `err.downcast_ref::<TcrlmError>()`.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TcrlmError {
    /// A record produced no informative token.
    #[error("Missing input at index {row}: {reason}")]
    MissingInput { row: usize, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Bad {column} symbol at index {row}: {symbol}")]
    GeneSymbol {
        row: usize,
        column: String,
        symbol: String,
    },

    #[error("Bad {column} sequence at index {row}: {sequence}")]
    InvalidSequence {
        row: usize,
        column: String,
        sequence: String,
    },

    #[error("Shape mismatch for parameter {parameter}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        parameter: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Parameter {0} is absent from the loaded state")]
    MissingParameter(String),

    #[error("Loaded state contains an unknown parameter {0}")]
    UnexpectedParameter(String),

    /// A token field, e.g. the position in an overlong CDR, has no row in
    /// its embedding table.
    #[error("Token value {index} is outside an embedding table of {size} entries")]
    OutOfVocabulary { index: usize, size: usize },

    /// Operation not available for this model variant.
    #[error("Not implemented: {0}")]
    Unsupported(String),
}

impl TcrlmError {
    pub fn configuration(msg: impl Into<String>) -> TcrlmError {
        TcrlmError::Configuration(msg.into())
    }
}
