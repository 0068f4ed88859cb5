//! Error taxonomy surfaced to callers of a sandbox session.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::{Finding, ModuleFailure, render_findings};

/// Coarse classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Static admission failure; never retried.
    Validation,
    /// Missing entry module or a module failing validation.
    ModuleResolution,
    /// Uncaught exception or interpreter failure during execution.
    RuntimeFault,
    /// The interpreter engine could not be initialized.
    Initialization,
    /// The session was disposed (explicitly, by timeout, or by worker loss).
    Disposal,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("script rejected:\n{}", render_findings(.errors))]
    Validation { errors: Vec<Finding> },

    #[error("modules rejected:\n{}", render_module_failures(.failures))]
    ModuleValidation { failures: Vec<ModuleFailure> },

    #[error("module not found: '{entry}'")]
    ModuleNotFound { entry: String },

    /// Carries the logs captured before the fault; ops are never returned.
    #[error("script failed: {message}")]
    Runtime { message: String, logs: Vec<String> },

    #[error("sandbox engine failed to initialize: {message}")]
    Initialization { message: String },

    #[error("sandbox session disposed")]
    Disposed,

    #[error("evaluation exceeded {after:?}; session disposed")]
    Timeout { after: Duration },

    #[error("sandbox worker exited unexpectedly")]
    WorkerTerminated,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation { .. } => ErrorKind::Validation,
            SandboxError::ModuleValidation { .. } | SandboxError::ModuleNotFound { .. } => {
                ErrorKind::ModuleResolution
            }
            SandboxError::Runtime { .. } => ErrorKind::RuntimeFault,
            SandboxError::Initialization { .. } => ErrorKind::Initialization,
            SandboxError::Disposed
            | SandboxError::Timeout { .. }
            | SandboxError::WorkerTerminated => ErrorKind::Disposal,
        }
    }

    /// Logs captured before a runtime fault (empty for other errors).
    pub fn logs(&self) -> &[String] {
        match self {
            SandboxError::Runtime { logs, .. } => logs,
            _ => &[],
        }
    }
}

fn render_module_failures(failures: &[ModuleFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}:\n{}", failure.module, render_findings(&failure.errors)))
        .collect::<Vec<_>>()
        .join("\n")
}
