//! Analytics job core shared types, IDs, and errors.
//!
//! This crate provides foundational types shared across the job core crates:
//! - Job and flush identity types
//! - The unified error type with stable codes and categories
//! - Epoch-millisecond time helpers

pub mod error;
pub mod id;
pub mod time;

pub use error::{Error, ErrorCategory, Result, StructuredError};
pub use id::{FlushId, JobId};
pub use time::EpochMillis;
