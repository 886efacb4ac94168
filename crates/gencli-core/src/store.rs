//! Index Store: the JSON snapshot of every indexed file

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{FileRecord, GenError, Result, paths};

/// File index stored in <home>/index.json
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    /// Index store inside the data directory.
    pub fn open(home: &Path) -> Self {
        Self::at(paths::index_path(home))
    }

    /// Index store at an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load from disk. A missing snapshot is an empty index.
    pub fn load(&self) -> Result<Vec<FileRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Replace the snapshot with `records`.
    pub fn save(&self, records: &[FileRecord]) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, content.as_bytes())
    }
}

/// Write `bytes` to `path` through a temp file in the same directory, so
/// readers see either the old snapshot or the new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| GenError::Storage(format!("failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}
