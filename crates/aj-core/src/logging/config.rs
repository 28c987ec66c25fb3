//! Logging configuration.
//!
//! `AJ_LOG` sets the level for this crate and `AJ_LOG_FORMAT` picks the
//! output. Without `AJ_LOG`, a `RUST_LOG` directive is passed to the filter
//! untouched. Explicit overrides from the embedding application win over both.

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per event.
    Jsonl,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" => Some(LogFormat::Human),
            "jsonl" | "json" => Some(LogFormat::Jsonl),
            _ => None,
        }
    }
}

/// Minimum level for `aj_core` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    const NAMES: [(&'static str, LogLevel); 6] = [
        ("trace", LogLevel::Trace),
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("off", LogLevel::Off),
    ];

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, level)| *level)
    }

    /// Level name as understood by an `EnvFilter` directive.
    pub fn directive(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, level)| *level == self)
            .map_or("info", |(name, _)| name)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Raw filter directive taken from `RUST_LOG`; overrides `level`.
    pub directive: Option<String>,
    /// Include timestamps in human output.
    pub timestamps: bool,
}

impl LogConfig {
    /// Build from the environment, then apply explicit overrides.
    pub fn from_env(level: Option<LogLevel>, format: Option<LogFormat>) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), level, format)
    }

    fn from_lookup<F>(lookup: F, level: Option<LogLevel>, format: Option<LogFormat>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LogConfig {
            timestamps: true,
            ..LogConfig::default()
        };

        match lookup("AJ_LOG").as_deref().and_then(LogLevel::parse) {
            Some(level) => config.level = level,
            None => config.directive = lookup("RUST_LOG").filter(|d| !d.trim().is_empty()),
        }
        if let Some(format) = lookup("AJ_LOG_FORMAT").as_deref().and_then(LogFormat::parse) {
            config.format = format;
        }

        if let Some(level) = level {
            config.level = level;
            config.directive = None;
        }
        if let Some(format) = format {
            config.format = format;
        }
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self.directive = None;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}
