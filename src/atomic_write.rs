//! Atomic file writes: temp file in the target directory, fsync, rename.
//!
//! Every persisted byte in the queue, the state store, and the workspace
//! goes through this module. A crash at any point leaves either the old
//! file or the new file, never a partial one.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

/// Atomically write raw bytes to `path`.
///
/// The temporary file is created in the target's own directory so the final
/// rename stays on one filesystem.
pub fn write_bytes_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory: {parent}"))?;
    }
    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in: {dir}"))?;
    tmp.write_all(bytes)
        .context("failed to write temporary file")?;
    tmp.as_file()
        .sync_all()
        .context("failed to fsync temporary file")?;
    tmp.persist(path.as_std_path())
        .map_err(|e| anyhow::anyhow!(e.error))
        .with_context(|| format!("failed to atomically rename into place: {path}"))?;
    Ok(())
}

/// Atomically write UTF-8 text to `path`.
pub fn write_text_atomic(path: &Utf8Path, content: &str) -> Result<()> {
    write_bytes_atomic(path, content.as_bytes())
}

/// Atomically write a pretty-printed JSON document to `path`.
pub fn write_json_atomic<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    write_bytes_atomic(path, json.as_bytes())
}

/// Read and deserialize a JSON document written by [`write_json_atomic`].
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<T> {
    let content =
        fs::read_to_string(path.as_std_path()).with_context(|| format!("failed to read: {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse JSON: {path}"))
}
