//! Deterministic, pure logic shared by the sandbox.
//!
//! Core modules are free of I/O and engine state. They operate on source
//! text and plain data and return deterministic outputs suitable for tests.

pub mod modules;
pub mod ops;
pub mod prescan;
pub mod protocol;
pub mod types;
pub mod validator;
