//! Sandboxed execution of untrusted rule-patch scripts.
//!
//! A script is admitted only if it passes a static check, then runs inside an
//! embedded interpreter on a dedicated worker thread, with a fresh context per
//! evaluation. The only way a script affects the host is through a small
//! capability bridge that records typed operations and log lines.
//!
//! - **[`core`]**: Pure, deterministic logic (validation, op parsing, module
//!   names, wire messages). No I/O, fully testable in isolation.
//! - **[`io`]**: The interpreter engine, the worker thread and config files.
//! - **[`host`]**: The async [`Session`](host::Session) callers talk to.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod host;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{ErrorKind, SandboxError};
pub use host::Session;
