// ABOUTME: Custom error types for the task engine
// ABOUTME: Distinguishes cancellation from tool, format and lookup failures

use std::fmt;

#[derive(Debug)]
pub enum EngineError {
    Cancelled,
    NotFound(String),
    ToolUnavailable(String),
    UnsupportedFormat(String),
    Process(String),
    InvalidSchedule(String),
}

impl EngineError {
    /// True when any error in the chain is a cancellation signal.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            let engine_error = cause.downcast_ref::<EngineError>();
            matches!(engine_error, Some(EngineError::Cancelled))
        })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Cancelled => write!(f, "Task was cancelled"),
            EngineError::NotFound(msg) => write!(f, "Not found: {}", msg),
            EngineError::ToolUnavailable(msg) => write!(f, "Tool unavailable: {}", msg),
            EngineError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            EngineError::Process(msg) => write!(f, "Process error: {}", msg),
            EngineError::InvalidSchedule(msg) => write!(f, "Invalid schedule: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}
