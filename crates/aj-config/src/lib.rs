//! Analytics job core configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for the core configuration file
//! - Config resolution (explicit path → env → XDG → defaults)
//! - Environment overrides for frequently tuned knobs
//! - Semantic validation

pub mod core;
pub mod resolve;
pub mod validate;

pub use crate::core::{
    CoreConfig, ExtractionConfig, FlushConfig, RealtimeConfig, RenormalizationConfig, RunnerConfig,
    UsageConfig,
};
pub use resolve::{load_config, resolve_config_path, ConfigSource, ResolvedConfig};
pub use validate::{validate, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

impl From<ValidationError> for aj_common::Error {
    fn from(err: ValidationError) -> Self {
        aj_common::Error::Config(err.to_string())
    }
}
