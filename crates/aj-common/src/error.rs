//! Error types for the analytics job core.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for callers deciding whether to retry
//!
//! # Agent-Facing Output
//!
//! Errors serialize to structured JSON:
//! ```json
//! {
//!   "code": 20,
//!   "category": "flush",
//!   "message": "flush flush-3f2a timed out after 5000ms",
//!   "recoverable": true,
//!   "context": { "flush_id": "flush-3f2a", "timeout_ms": 5000 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for job core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Job state machine violations.
    Lifecycle,
    /// Flush request/acknowledgement synchronization.
    Flush,
    /// Usage, quantile, and score persistence.
    Persistence,
    /// Periodic task scheduling.
    Scheduling,
    /// Chunked data extraction.
    Extraction,
    /// Backing computation process I/O.
    Process,
    /// Configuration loading and validation.
    Config,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
            ErrorCategory::Flush => write!(f, "flush"),
            ErrorCategory::Persistence => write!(f, "persistence"),
            ErrorCategory::Scheduling => write!(f, "scheduling"),
            ErrorCategory::Extraction => write!(f, "extraction"),
            ErrorCategory::Process => write!(f, "process"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the job core.
#[derive(Error, Debug)]
pub enum Error {
    // Lifecycle errors (10-19)
    #[error("job {job_id}: invalid state transition {from} -> {to}")]
    InvalidStateTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("job {job_id} is not open (state: {state})")]
    JobNotOpen { job_id: String, state: String },

    // Flush errors (20-29)
    #[error("flush {flush_id} timed out after {timeout_ms}ms")]
    FlushTimeout { flush_id: String, timeout_ms: u64 },

    #[error("flush {flush_id} abandoned: flush coordination was cleared")]
    FlushCleared { flush_id: String },

    // Persistence errors (30-39)
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    // Scheduling errors (40-49)
    #[error("task runner '{name}' did not stop within {timeout_ms}ms")]
    TaskRunnerStopTimeout { name: String, timeout_ms: u64 },

    #[error("task runner '{name}' cannot be started in state {state}")]
    AlreadyStarted { name: String, state: String },

    // Extraction errors (50-59)
    #[error("invalid chunk range [{start}, {end}) with span {span:?}")]
    InvalidChunkRange {
        start: i64,
        end: i64,
        span: Option<i64>,
    },

    #[error("data extraction failed: {0}")]
    Extraction(String),

    // Process errors (60-69)
    #[error("backing process error: {0}")]
    Process(String),

    // Config errors (70-79)
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors (80-89)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Lifecycle errors
    /// - 20-29: Flush errors
    /// - 30-39: Persistence errors
    /// - 40-49: Scheduling errors
    /// - 50-59: Extraction errors
    /// - 60-69: Process errors
    /// - 70-79: Config errors
    /// - 80-89: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidStateTransition { .. } => 10,
            Error::JobNotOpen { .. } => 11,
            Error::FlushTimeout { .. } => 20,
            Error::FlushCleared { .. } => 21,
            Error::PersistenceFailure(_) => 30,
            Error::TaskRunnerStopTimeout { .. } => 40,
            Error::AlreadyStarted { .. } => 41,
            Error::InvalidChunkRange { .. } => 50,
            Error::Extraction(_) => 51,
            Error::Process(_) => 60,
            Error::Config(_) => 70,
            Error::Io(_) => 80,
            Error::Json(_) => 81,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidStateTransition { .. } | Error::JobNotOpen { .. } => {
                ErrorCategory::Lifecycle
            }
            Error::FlushTimeout { .. } | Error::FlushCleared { .. } => ErrorCategory::Flush,
            Error::PersistenceFailure(_) => ErrorCategory::Persistence,
            Error::TaskRunnerStopTimeout { .. } | Error::AlreadyStarted { .. } => {
                ErrorCategory::Scheduling
            }
            Error::InvalidChunkRange { .. } | Error::Extraction(_) => ErrorCategory::Extraction,
            Error::Process(_) => ErrorCategory::Process,
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    ///
    /// None of the core components retry on their own; this is a hint for
    /// the caller's retry policy.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // The job is untouched; retry with a legal transition.
            Error::InvalidStateTransition { .. } => true,
            Error::JobNotOpen { .. } => true,

            // Re-issue the flush or escalate to closing the job.
            Error::FlushTimeout { .. } => true,
            Error::FlushCleared { .. } => false,

            // Counters are kept, the next tick persists them again.
            Error::PersistenceFailure(_) => true,

            // Retry stop with a longer deadline.
            Error::TaskRunnerStopTimeout { .. } => true,
            Error::AlreadyStarted { .. } => false,

            Error::InvalidChunkRange { .. } => false,
            Error::Extraction(_) => true,

            Error::Process(_) => false,
            Error::Config(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context (e.g., job id, flush id).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::InvalidStateTransition { job_id, from, to } => {
                context.insert("job_id".to_string(), serde_json::json!(job_id));
                context.insert("from".to_string(), serde_json::json!(from));
                context.insert("to".to_string(), serde_json::json!(to));
            }
            Error::JobNotOpen { job_id, state } => {
                context.insert("job_id".to_string(), serde_json::json!(job_id));
                context.insert("state".to_string(), serde_json::json!(state));
            }
            Error::FlushTimeout {
                flush_id,
                timeout_ms,
            } => {
                context.insert("flush_id".to_string(), serde_json::json!(flush_id));
                context.insert("timeout_ms".to_string(), serde_json::json!(timeout_ms));
            }
            Error::FlushCleared { flush_id } => {
                context.insert("flush_id".to_string(), serde_json::json!(flush_id));
            }
            Error::TaskRunnerStopTimeout { name, timeout_ms } => {
                context.insert("runner".to_string(), serde_json::json!(name));
                context.insert("timeout_ms".to_string(), serde_json::json!(timeout_ms));
            }
            Error::InvalidChunkRange { start, end, span } => {
                context.insert("start".to_string(), serde_json::json!(start));
                context.insert("end".to_string(), serde_json::json!(end));
                context.insert("span".to_string(), serde_json::json!(span));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}
