//! Tracing/logging (shared setup).

/// Tracing configuration (filters, formats, sinks).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, UnknownLogFormat, init};
