//! Side-effecting parts of the sandbox: configuration files, the embedded
//! interpreter and the worker thread that owns it.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod worker;
