//! Job and flush identity types.
//!
//! A job is identified by an opaque string that never changes for the
//! lifetime of the job. Flush IDs are generated per flush invocation by the
//! command-issuing side and are never reused.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

/// Opaque identifier for a single flush request.
///
/// Ids produced by [`FlushId::generate`] are UUIDv4-based so two flushes
/// issued by the same job never share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlushId(String);

impl FlushId {
    /// Wrap an id received from elsewhere (e.g. parsed from process output).
    pub fn new(id: impl Into<String>) -> Self {
        FlushId(id.into())
    }

    /// Generate a fresh, unique flush id.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        FlushId(format!("flush-{}", &uuid[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlushId {
    fn from(id: &str) -> Self {
        FlushId(id.to_string())
    }
}
