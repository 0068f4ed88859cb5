//! Test-only helpers for building scripts and script files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::validator::STRICT_MODE_DIRECTIVE;

/// Prefix `body` with the strict mode directive.
pub fn strict(body: &str) -> String {
    format!("\"{STRICT_MODE_DIRECTIVE}\";\n{body}")
}

/// Write `contents` to `dir/name`, creating parent directories.
pub fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script directory");
    }
    fs::write(&path, contents).expect("write script");
    path
}

/// Temporary directory holding script files for one test.
pub fn script_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}
