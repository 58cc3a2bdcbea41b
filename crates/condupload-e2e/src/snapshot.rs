//! Payload staging: base snapshots and per-step working copies.
//!
//! A campaign prepares a handful of *base* snapshot files (one per since
//! range it uploads from) and copies the relevant one into a working file
//! named after the destination tag before every step.  Working files are
//! transient: they are deleted again once the step's assertions ran.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::query_tool::QueryTool;
use crate::scenario::{BaseFile, InputDataset};
use crate::HarnessResult;

/// A prepared base snapshot plus its digest, recorded in the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseSnapshot {
    pub path: PathBuf,
    pub sha256: String,
}

impl BaseSnapshot {
    /// Wrap an existing snapshot file, computing its digest.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Io` when the file cannot be read.
    pub fn from_file(path: PathBuf) -> HarnessResult<Self> {
        let sha256 = hash_file(&path)?;
        Ok(Self { path, sha256 })
    }
}

/// SHA-256 hex digest of a file's contents.
///
/// # Errors
///
/// Returns `HarnessError::Io` when the file cannot be read.
pub fn hash_file(path: &Path) -> HarnessResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// Copy `base` into the working snapshot for `dest_tag` and return the
/// working-file *stem* (path without extension); the snapshot lives at
/// `<stem>.db` and the metadata file the caller writes at `<stem>.json`.
///
/// # Errors
///
/// Returns `HarnessError::Io` on copy failure.
pub fn stage_for_upload(
    base: &BaseSnapshot,
    workdir: &Path,
    dest_tag: &str,
) -> HarnessResult<PathBuf> {
    let stem = workdir.join(dest_tag);
    std::fs::copy(&base.path, stem.with_extension("db"))?;
    debug!(dest_tag, base = %base.path.display(), "staged working snapshot");
    Ok(stem)
}

/// Remove a step's working files.  Missing files are fine; a failed step
/// may not have produced both.
pub fn remove_staged(stem: &Path) {
    for ext in ["db", "json"] {
        let _ = std::fs::remove_file(stem.with_extension(ext));
    }
}

/// Source of base snapshots for the driver.
///
/// The production implementation shells out to the query tool; tests build
/// snapshot files directly.
pub trait SnapshotProvider {
    /// Return the base snapshot of the given kind, exporting it on first use.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the tool-backed provider surfaces
    /// `HarnessError::SnapshotMissing` when the export produced nothing.
    fn base(&mut self, kind: BaseFile, dataset: &InputDataset) -> HarnessResult<BaseSnapshot>;
}

/// Query-tool-backed snapshot provider with one cached export per kind.
pub struct ToolSnapshotProvider {
    tool: QueryTool,
    workdir: PathBuf,
    cache: HashMap<BaseFile, BaseSnapshot>,
}

impl ToolSnapshotProvider {
    #[must_use]
    pub fn new(tool: QueryTool, workdir: PathBuf) -> Self {
        Self {
            tool,
            workdir,
            cache: HashMap::new(),
        }
    }
}

impl SnapshotProvider for ToolSnapshotProvider {
    fn base(&mut self, kind: BaseFile, dataset: &InputDataset) -> HarnessResult<BaseSnapshot> {
        if let Some(cached) = self.cache.get(&kind) {
            return Ok(cached.clone());
        }

        let (from, to) = kind.since_range(dataset);
        let file_name = match kind {
            BaseFile::FreshPrimary => format!("{}_{from}_fresh.db", dataset.input_tag),
            _ => format!("{}_{from}.db", dataset.input_tag),
        };
        let dest = self.workdir.join(file_name);
        self.tool
            .export_tag_range(dataset.input_tag, from, to, &dest)?;
        let snapshot = BaseSnapshot::from_file(dest)?;
        self.cache.insert(kind, snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_file_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();

        let h1 = hash_file(&path).unwrap();
        let h2 = hash_file(&path).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(
            h1,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        std::fs::write(&path, b"hello world!").unwrap();
        assert_ne!(hash_file(&path).unwrap(), h1);
    }

    #[test]
    fn stage_and_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.db");
        std::fs::write(&base_path, b"payload").unwrap();
        let base = BaseSnapshot::from_file(base_path).unwrap();

        let stem = stage_for_upload(&base, dir.path(), "dest_tag_any").unwrap();
        assert!(stem.with_extension("db").exists());
        assert_eq!(
            std::fs::read(stem.with_extension("db")).unwrap(),
            b"payload"
        );

        std::fs::write(stem.with_extension("json"), b"{}").unwrap();
        remove_staged(&stem);
        assert!(!stem.with_extension("db").exists());
        assert!(!stem.with_extension("json").exists());
    }

    #[test]
    fn remove_staged_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        remove_staged(&dir.path().join("never_staged"));
    }
}
