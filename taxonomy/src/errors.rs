//! Taxonomy error types
//!
//! Configuration errors are fatal and raised before any record is touched.
//! Predicate failures are recovered per record and surface through
//! [`RecordError`] in the classification output instead of aborting a pass.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category for structured logging and behavior mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed rule, rule set, rules document or config file
    ConfigurationError,
    /// A predicate failed against a specific record
    PredicateEvaluationError,
    /// Failures reading or writing the product/measure store or ledger
    StoreError,
    /// Unexpected logic bugs
    InternalError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "CONFIG_ERROR",
            Self::PredicateEvaluationError => "PREDICATE_EVALUATION_ERROR",
            Self::StoreError => "STORE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether a pass can keep going after this error
    pub fn pass_recoverable(&self) -> bool {
        matches!(self, Self::PredicateEvaluationError)
    }
}

/// Taxonomy error with category and context
#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("predicate evaluation error: {message}")]
    PredicateEvaluation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TaxonomyError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::ConfigurationError,
            Self::PredicateEvaluation { .. } => ErrorCategory::PredicateEvaluationError,
            Self::Store { .. } => ErrorCategory::StoreError,
            Self::Internal { .. } => ErrorCategory::InternalError,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }
}

impl From<PredicateError> for TaxonomyError {
    fn from(err: PredicateError) -> Self {
        Self::PredicateEvaluation {
            message: err.message,
            source: None,
        }
    }
}

/// Failure raised by a predicate while evaluating one record.
///
/// Built-in conditions never produce this; custom predicates may.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PredicateError {
    pub message: String,
}

impl PredicateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-record classification failure, reported alongside the pass output.
///
/// The record keeps the labels it had before the failing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub product_id: i64,
    pub pass: String,
    pub rule_id: String,
    pub message: String,
}

/// Result type for taxonomy operations
pub type Result<T> = std::result::Result<T, TaxonomyError>;
