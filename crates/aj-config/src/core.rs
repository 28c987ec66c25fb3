//! Core configuration schema.
//!
//! Every section has defaults, so a config file only needs to name the
//! knobs it changes:
//!
//! ```toml
//! [usage]
//! report_interval_ms = 5000
//!
//! [extraction]
//! chunk_span_ms = 3600000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::validate::ValidationError;

/// Environment variable overrides.
pub const ENV_USAGE_REPORT_INTERVAL_MS: &str = "AJ_USAGE_REPORT_INTERVAL_MS";
pub const ENV_FLUSH_TIMEOUT_MS: &str = "AJ_FLUSH_TIMEOUT_MS";
pub const ENV_CHUNK_SPAN_MS: &str = "AJ_CHUNK_SPAN_MS";
pub const ENV_RENORMALIZATION_ENABLED: &str = "AJ_RENORMALIZATION_ENABLED";

/// Top-level configuration for the job execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub schema_version: String,
    pub usage: UsageConfig,
    pub flush: FlushConfig,
    pub runner: RunnerConfig,
    pub extraction: ExtractionConfig,
    pub realtime: RealtimeConfig,
    pub renormalization: RenormalizationConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            usage: UsageConfig::default(),
            flush: FlushConfig::default(),
            runner: RunnerConfig::default(),
            extraction: ExtractionConfig::default(),
            realtime: RealtimeConfig::default(),
            renormalization: RenormalizationConfig::default(),
        }
    }
}

/// Usage (bytes/fields/records read) reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Minimum time between two usage persistence calls.
    pub report_interval_ms: u64,
    /// Log progress when the record count reaches 1, 10, 100, ... records.
    pub log_milestones: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 10_000,
            log_milestones: true,
        }
    }
}

impl UsageConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Flush request/acknowledgement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// How long a flush waits for its acknowledgement.
    pub default_timeout_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
        }
    }
}

impl FlushConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Periodic task runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How long `stop` waits for an in-flight task before giving up.
    pub stop_timeout_ms: u64,
    /// Delay added after an aligned schedule boundary so the task runs
    /// strictly after it.
    pub next_task_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 60_000,
            next_task_delay_ms: 100,
        }
    }
}

impl RunnerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn next_task_delay(&self) -> Duration {
        Duration::from_millis(self.next_task_delay_ms)
    }
}

/// Historical (lookback) extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Span of each extraction chunk. `None` extracts the whole range at once.
    pub chunk_span_ms: Option<i64>,
    /// Flush the backing process after each chunk.
    pub flush_after_chunk: bool,
    /// Target documents per chunk when the span is estimated from a data
    /// summary.
    pub docs_per_chunk: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunk_span_ms: None,
            flush_after_chunk: true,
            docs_per_chunk: 10_000,
        }
    }
}

/// Real-time extraction: one search per `frequency_ms`, lagging the
/// wall clock by `query_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Search cadence; window ends are aligned to multiples of it.
    pub frequency_ms: u64,
    /// How far behind now a window may end, for late-arriving data.
    pub query_delay_ms: u64,
    /// When set, the resume point is rounded up to a bucket boundary.
    pub bucket_span_ms: Option<u64>,
    /// Consecutive searches without data before the job is closed.
    pub max_empty_runs: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            frequency_ms: 60_000,
            query_delay_ms: 60_000,
            bucket_span_ms: None,
            max_empty_runs: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}

/// Score renormalization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenormalizationConfig {
    /// `false` swaps in the no-op renormalizer.
    pub enabled: bool,
    /// Buckets read per page while rescoring.
    pub page_size: usize,
}

impl Default for RenormalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 100,
        }
    }
}

impl CoreConfig {
    /// Load a config file, choosing the parser by extension (`.json` or TOML).
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&content),
            _ => Self::parse_toml(&content),
        }
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::ParseError(format!("Invalid JSON: {}", e)))
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(text: &str) -> Result<Self, ValidationError> {
        toml::from_str(text).map_err(|e| ValidationError::ParseError(format!("Invalid TOML: {}", e)))
    }

    /// Apply `AJ_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ValidationError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_USAGE_REPORT_INTERVAL_MS) {
            self.usage.report_interval_ms = parse_env(ENV_USAGE_REPORT_INTERVAL_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_FLUSH_TIMEOUT_MS) {
            self.flush.default_timeout_ms = parse_env(ENV_FLUSH_TIMEOUT_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_CHUNK_SPAN_MS) {
            self.extraction.chunk_span_ms = match val.trim() {
                "" | "none" | "off" => None,
                other => Some(parse_env(ENV_CHUNK_SPAN_MS, other)?),
            };
        }
        if let Some(val) = lookup(ENV_RENORMALIZATION_ENABLED) {
            self.renormalization.enabled = match val.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ValidationError::InvalidValue {
                        field: ENV_RENORMALIZATION_ENABLED.to_string(),
                        message: format!("expected a boolean, got '{}'", val),
                    })
                }
            };
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T, ValidationError>
where
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse::<T>()
        .map_err(|e| ValidationError::InvalidValue {
            field: key.to_string(),
            message: format!("'{}': {}", val, e),
        })
}
