//! Shared helpers for unit tests.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable shell script standing in for an external tool.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
