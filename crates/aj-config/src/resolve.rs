//! Configuration resolution and path discovery.
//!
//! Resolution order: explicit path → environment variables → XDG paths → defaults.

use std::path::{Path, PathBuf};

use crate::core::CoreConfig;
use crate::validate::{validate, ValidationResult};

/// Where the configuration was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Passed explicitly by the embedding application.
    Explicit,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit => write!(f, "explicit path"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// A loaded, validated configuration and its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: CoreConfig,
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Environment variable names.
pub const ENV_CONFIG_PATH: &str = "AJ_CONFIG";
pub const ENV_CONFIG_DIR: &str = "AJ_CONFIG_DIR";

/// Standard config file name.
const CONFIG_FILENAME: &str = "core.toml";

/// Application name for XDG directories.
const APP_NAME: &str = "analytics-jobs";

/// Resolve the config file path.
///
/// 1. Explicit path (if it exists)
/// 2. `AJ_CONFIG` (direct path)
/// 3. `AJ_CONFIG_DIR` + `core.toml`
/// 4. XDG config directory (~/.config/analytics-jobs/core.toml)
/// 5. Built-in defaults (None)
pub fn resolve_config_path(explicit: Option<&Path>) -> (Option<PathBuf>, ConfigSource) {
    if let Some(path) = explicit {
        if path.exists() {
            return (Some(path.to_path_buf()), ConfigSource::Explicit);
        }
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    if let Some(dir) = xdg_config_dir() {
        let path = dir.join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::XdgConfig);
        }
    }

    (None, ConfigSource::BuiltinDefault)
}

/// Resolve, load, apply environment overrides, and validate.
pub fn load_config(explicit: Option<&Path>) -> ValidationResult<ResolvedConfig> {
    let (path, source) = resolve_config_path(explicit);

    let mut config = match &path {
        Some(p) => CoreConfig::from_file(p)?,
        None => CoreConfig::default(),
    };
    config.apply_env_overrides()?;
    validate(&config)?;

    Ok(ResolvedConfig {
        config,
        path,
        source,
    })
}

/// Get the XDG config directory for analytics jobs.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}
