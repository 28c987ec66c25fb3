//! No-mock configuration loading + resolution tests.
//!
//! Covers:
//! - TOML and JSON config files on disk
//! - Resolution order (explicit > AJ_CONFIG > AJ_CONFIG_DIR > XDG > defaults)
//! - Environment overrides applied on top of file values

use aj_config::resolve::{load_config, resolve_config_path, ConfigSource};
use aj_config::{CoreConfig, ValidationError};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

const ENV_KEYS: &[&str] = &[
    "AJ_CONFIG",
    "AJ_CONFIG_DIR",
    "XDG_CONFIG_HOME",
    "AJ_USAGE_REPORT_INTERVAL_MS",
    "AJ_FLUSH_TIMEOUT_MS",
    "AJ_CHUNK_SPAN_MS",
    "AJ_RENORMALIZATION_ENABLED",
];

struct EnvGuard {
    keys: Vec<String>,
    saved: Vec<Option<String>>,
}

impl EnvGuard {
    fn new(keys: &[&str]) -> Self {
        let saved = keys.iter().map(|key| env::var(key).ok()).collect();
        let guard = Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            saved,
        };
        for key in keys {
            env::remove_var(key);
        }
        guard
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (idx, key) in self.keys.iter().enumerate() {
            match self.saved.get(idx).and_then(|v| v.as_ref()) {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    f()
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write config");
}

#[test]
fn test_from_file_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("core.toml");
    write_file(
        &path,
        "[flush]\ndefault_timeout_ms = 1500\n\n[renormalization]\npage_size = 25\n",
    );

    let config = CoreConfig::from_file(&path).unwrap();
    assert_eq!(config.flush.default_timeout_ms, 1500);
    assert_eq!(config.renormalization.page_size, 25);
    assert_eq!(config.usage.report_interval_ms, 10_000);
}

#[test]
fn test_from_file_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("core.json");
    write_file(&path, r#"{"extraction": {"chunk_span_ms": 60000}}"#);

    let config = CoreConfig::from_file(&path).unwrap();
    assert_eq!(config.extraction.chunk_span_ms, Some(60_000));
}

#[test]
fn test_from_file_missing() {
    let err = CoreConfig::from_file(Path::new("/nonexistent/aj/core.toml")).unwrap_err();
    assert!(matches!(err, ValidationError::IoError(_)));
}

#[test]
fn test_resolve_explicit_over_env() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("explicit.toml");
        let from_env = dir.path().join("env.toml");
        write_file(&explicit, "");
        write_file(&from_env, "");
        env::set_var("AJ_CONFIG", &from_env);

        let (path, source) = resolve_config_path(Some(&explicit));
        assert_eq!(path.as_deref(), Some(explicit.as_path()));
        assert_eq!(source, ConfigSource::Explicit);

        let (path, source) = resolve_config_path(None);
        assert_eq!(path.as_deref(), Some(from_env.as_path()));
        assert_eq!(source, ConfigSource::Environment);
    });
}

#[test]
fn test_resolve_config_dir_then_xdg() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let dir = TempDir::new().unwrap();
        let xdg = dir.path().join("xdg");
        write_file(&xdg.join("analytics-jobs").join("core.toml"), "");
        env::set_var("XDG_CONFIG_HOME", &xdg);

        let (_, source) = resolve_config_path(None);
        assert_eq!(source, ConfigSource::XdgConfig);

        let config_dir = dir.path().join("cfg");
        write_file(&config_dir.join("core.toml"), "");
        env::set_var("AJ_CONFIG_DIR", &config_dir);

        let (path, source) = resolve_config_path(None);
        assert_eq!(source, ConfigSource::Environment);
        assert_eq!(path, Some(config_dir.join("core.toml")));
    });
}

#[test]
fn test_load_defaults_when_nothing_found() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let dir = TempDir::new().unwrap();
        env::set_var("XDG_CONFIG_HOME", dir.path());

        let resolved = load_config(None).unwrap();
        assert_eq!(resolved.source, ConfigSource::BuiltinDefault);
        assert!(resolved.path.is_none());
        assert_eq!(resolved.config, CoreConfig::default());
    });
}

#[test]
fn test_load_applies_env_overrides() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.toml");
        write_file(&path, "[usage]\nreport_interval_ms = 5000\n");
        env::set_var("AJ_USAGE_REPORT_INTERVAL_MS", "750");
        env::set_var("AJ_RENORMALIZATION_ENABLED", "false");

        let resolved = load_config(Some(&path)).unwrap();
        assert_eq!(resolved.source, ConfigSource::Explicit);
        assert_eq!(resolved.config.usage.report_interval_ms, 750);
        assert!(!resolved.config.renormalization.enabled);
    });
}

#[test]
fn test_load_rejects_invalid_values() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.toml");
        write_file(&path, "[extraction]\nchunk_span_ms = 0\n");

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
        assert!(err.to_string().contains("extraction.chunk_span_ms"));
    });
}
