//! Directory Scanner: enumerate candidate files under the configured roots

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::{DirEntry, WalkBuilder};

use crate::{Config, FileRecord};

/// Walks root directories and yields a record stub per file.
///
/// Each call to [`Scanner::iter`] is an independent walk; the same tree
/// yields the same records in the same order.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    roots: Vec<PathBuf>,
    skip_types: Vec<String>,
    skip_files: Vec<String>,
    excluded: Vec<PathBuf>,
}

impl Scanner {
    pub fn new(roots: Vec<PathBuf>, skip_types: Vec<String>, skip_files: Vec<String>) -> Self {
        Self {
            roots,
            skip_types,
            skip_files,
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.directories.clone(),
            config.skip_types.clone(),
            config.skip_files.clone(),
        )
    }

    /// Never descend into `path` (used for the data directory itself).
    pub fn exclude(mut self, path: &Path) -> Self {
        self.excluded
            .push(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
        self
    }

    /// Lazily walk every valid root in order, assigning ids in visit order.
    pub fn iter(&self) -> impl Iterator<Item = FileRecord> + '_ {
        self.roots
            .iter()
            .filter_map(|root| checked_root(root))
            .flat_map(move |root| self.walk_root(root))
            .enumerate()
            .map(|(id, mut record)| {
                record.id = id;
                record
            })
    }

    fn walk_root(&self, root: PathBuf) -> impl Iterator<Item = FileRecord> + '_ {
        let excluded = self.excluded.clone();
        WalkBuilder::new(&root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| !excluded.iter().any(|ex| entry.path() == ex))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter_map(move |entry| self.to_record(&entry))
    }

    fn to_record(&self, entry: &DirEntry) -> Option<FileRecord> {
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            return None;
        }

        // Records store names and directories as JSON strings.
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!("Skipping {}: name is not valid UTF-8", entry.path().display());
            return None;
        };
        if entry.path().to_str().is_none() {
            tracing::warn!("Skipping {}: path is not valid UTF-8", entry.path().display());
            return None;
        }

        if should_skip(&name, &self.skip_types, &self.skip_files) {
            tracing::debug!("Skipping {} (skip rule)", entry.path().display());
            return None;
        }

        // Follows symlinks so a link reports its target's size and mtime.
        let metadata = match std::fs::metadata(entry.path()) {
            Ok(m) if m.is_dir() => return None,
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                return None;
            }
        };

        let modified_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        let directory = entry.path().parent()?.to_path_buf();

        Some(FileRecord::new(
            0,
            name,
            directory,
            metadata.len(),
            modified_time,
        ))
    }
}

/// A root that exists and is a directory, made absolute. Anything else is
/// logged and left out of the scan.
fn checked_root(root: &Path) -> Option<PathBuf> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => match root.canonicalize() {
            Ok(abs) => Some(abs),
            Err(e) => {
                tracing::warn!("Error resolving directory {}: {}", root.display(), e);
                None
            }
        },
        Ok(_) => {
            tracing::warn!("Path {} is not a directory, skipping", root.display());
            None
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Directory {} does not exist, skipping", root.display());
            None
        }
        Err(e) => {
            tracing::warn!("Error checking directory {}: {}", root.display(), e);
            None
        }
    }
}

/// Suffix match against `skip_types`, prefix match against `skip_files`.
pub fn should_skip(file_name: &str, skip_types: &[String], skip_files: &[String]) -> bool {
    skip_types
        .iter()
        .any(|suffix| !suffix.is_empty() && file_name.ends_with(suffix.as_str()))
        || skip_files
            .iter()
            .any(|prefix| !prefix.is_empty() && file_name.starts_with(prefix.as_str()))
}
