//! Shared deterministic types for scriptbox core logic.
//!
//! These types define the stable contracts between the validator, the worker
//! and the host session. They carry no engine handles and no I/O state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ops::SandboxOp;

/// Category of a static admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Source failed to parse.
    Syntax,
    /// First statement is not the `"use strict"` directive.
    MissingStrictMode,
    /// `import`/`export` in any form, including dynamic `import()`.
    ModuleSyntax,
    /// `with` statement.
    WithStatement,
    /// `debugger` statement.
    Debugger,
    /// `new.target` or `import.meta`.
    MetaProperty,
    /// Call or construction of a dynamic code evaluation primitive.
    ForbiddenCallee,
    /// Source exceeds the configured size limit.
    SourceTooLarge,
    /// Bracket nesting exceeds the configured depth limit.
    NestingTooDeep,
    /// The validator itself failed; the source is rejected.
    Internal,
}

/// 1-based line and column (columns count characters, not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// One located validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Finding {
    pub fn new(kind: FindingKind, message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Outcome of static validation.
///
/// `ok()` is derived from `errors`, so the two can never disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<Finding>,
}

impl ValidationResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_kind(&self, kind: FindingKind) -> bool {
        self.errors.iter().any(|finding| finding.kind == kind)
    }
}

impl Serialize for ValidationResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Report<'a> {
            ok: bool,
            errors: &'a [Finding],
        }

        Report {
            ok: self.ok(),
            errors: &self.errors,
        }
        .serialize(serializer)
    }
}

/// Successful evaluation payload returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalOutput {
    /// Recognized ops: imperative calls in call order, then the declarative
    /// `output.ops` entries in array order.
    pub ops: Vec<SandboxOp>,
    pub logs: Vec<String>,
    /// JSON form of the program's completion value (`null` when undefined or
    /// not serializable).
    pub output: Value,
}

/// Validation findings for one module of an `EvalModule` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFailure {
    pub module: String,
    pub errors: Vec<Finding>,
}

/// Render findings as one bullet per line (`- line:col: message`).
pub fn render_findings(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|finding| format!("- {finding}"))
        .collect::<Vec<_>>()
        .join("\n")
}
