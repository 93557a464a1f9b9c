//! Crate-wide error types.
//!
//! Kept as plain enums with manual `Display`/`Error` impls, matching the
//! rest of the codebase's habit of not reaching for a derive-macro crate
//! for something this small.

use std::fmt;

#[derive(Debug)]
pub enum PipelineError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    Storage { source: String },
    Config { field: String, reason: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io(e) => write!(f, "io error: {e}"),
            PipelineError::Serde(e) => write!(f, "serialization error: {e}"),
            PipelineError::Storage { source } => write!(f, "storage error: {source}"),
            PipelineError::Config { field, reason } => {
                write!(f, "config error on '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serde(e)
    }
}

/// Error surface for a [`crate::source::SampleSource`]. Transient errors are
/// retried by `safe_collect`; permanent ones still go through the retry loop
/// (the source doesn't get to opt out) but are worth distinguishing in logs.
#[derive(Debug, Clone)]
pub enum SourceError {
    Transient(String),
    Permanent(String),
    RateLimited,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Transient(msg) => write!(f, "transient error: {msg}"),
            SourceError::Permanent(msg) => write!(f, "permanent error: {msg}"),
            SourceError::RateLimited => write!(f, "rate limited"),
        }
    }
}

impl std::error::Error for SourceError {}
