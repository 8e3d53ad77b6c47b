//! Atomic file writes shared by the checkpoint store.
//!
//! Artifacts are written to a `.tmp` sibling and hard-linked into place, so a
//! crash mid-write never leaves a half-written checkpoint under its final
//! name, and an existing artifact is never replaced.

use std::io;
use std::path::Path;

/// Serialize `data` as pretty JSON and atomically create `path`.
///
/// Fails with `ErrorKind::AlreadyExists` when `path` is already present;
/// existing artifacts are never replaced. Creates parent directories.
pub fn create_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    create_atomic(path, &json)
}

/// Atomically create `path` with `data`, refusing to overwrite.
///
/// The final name is created with `hard_link`, which fails if the target
/// exists, so two writers racing for the same name cannot both succeed.
pub fn create_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
    std::fs::write(&tmp, data)?;
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    linked
}
