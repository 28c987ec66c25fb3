//! Configuration validation errors and semantic validation.

use thiserror::Error;

use crate::core::CoreConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

/// Validate a core configuration semantically.
pub fn validate(config: &CoreConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    if config.usage.report_interval_ms == 0 {
        return Err(invalid("usage.report_interval_ms", "must be > 0"));
    }

    if config.flush.default_timeout_ms == 0 {
        return Err(invalid("flush.default_timeout_ms", "must be > 0"));
    }

    if config.runner.stop_timeout_ms == 0 {
        return Err(invalid("runner.stop_timeout_ms", "must be > 0"));
    }

    if let Some(span) = config.extraction.chunk_span_ms {
        if span <= 0 {
            return Err(invalid(
                "extraction.chunk_span_ms",
                &format!("must be > 0 when set, got {}", span),
            ));
        }
    }

    if config.extraction.docs_per_chunk == 0 {
        return Err(invalid("extraction.docs_per_chunk", "must be > 0"));
    }

    if config.realtime.frequency_ms == 0 {
        return Err(invalid("realtime.frequency_ms", "must be > 0"));
    }

    if config.realtime.bucket_span_ms == Some(0) {
        return Err(invalid("realtime.bucket_span_ms", "must be > 0 when set"));
    }

    if config.realtime.max_empty_runs == 0 {
        return Err(invalid("realtime.max_empty_runs", "must be > 0"));
    }

    if config.renormalization.page_size == 0 {
        return Err(invalid("renormalization.page_size", "must be > 0"));
    }

    Ok(())
}

fn invalid(field: &str, message: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
