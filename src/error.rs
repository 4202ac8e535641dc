//! Error types for the compiler pipeline. User-level problems (bad syntax,
//! unknown names, flow mistakes) are reported through the diagnostic buffer
//! and do not use these types; `CompileError` covers failures that stop the
//! pipeline outright.

use thiserror::Error;

use crate::frontend::OptPos;

#[derive(Debug, Error)]
pub enum CompileError {
    /// A pipeline pass encountered a shape that should be impossible. These
    /// indicate compiler bugs, not user mistakes.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact error: {0}")]
    Artifact(#[from] serde_json::Error),
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// How bad a diagnostic is. Only `Error` makes the compile fail.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Informational,
    Warning,
    Error,
}

/// A user-facing message tied to an optional source position. Diagnostics
/// accumulate in the compiler state and are flushed in source order at exit.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub pos: OptPos,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, pos: OptPos) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            pos,
        }
    }

    pub fn warning(message: impl Into<String>, pos: OptPos) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            pos,
        }
    }
}
