//! Change Reconciler: diff a fresh scan against the persisted index

use std::collections::{HashMap, HashSet};

use crate::{FileRecord, FingerprintStore};

/// Outcome of reconciling one scan.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Unchanged files, carried over from the index with their description
    /// and embedding intact
    pub carried: Vec<FileRecord>,
    /// Files that need a description and an embedding
    pub new: Vec<FileRecord>,
    /// Files whose fingerprint was already registered but which have no
    /// record in the index
    pub skipped: usize,
    /// Fingerprints dropped from the store because no scanned file produced them
    pub removed: Vec<String>,
}

impl Reconciliation {
    pub fn is_unchanged(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty()
    }
}

/// Classify scanned candidates as carried or new, and prune the fingerprint
/// store of files that disappeared.
///
/// New fingerprints are registered as soon as they are seen, so a file
/// reached twice in one scan (overlapping roots) is generated once.
pub fn reconcile(
    candidates: impl IntoIterator<Item = FileRecord>,
    prior: Vec<FileRecord>,
    fingerprints: &FingerprintStore,
) -> Reconciliation {
    let mut prior_by_fingerprint: HashMap<String, FileRecord> = HashMap::with_capacity(prior.len());
    for record in prior {
        prior_by_fingerprint
            .entry(record.fingerprint())
            .or_insert(record);
    }

    let mut result = Reconciliation::default();
    let mut seen = HashSet::new();

    for candidate in candidates {
        let fingerprint = candidate.fingerprint();
        if !seen.insert(fingerprint.clone()) {
            continue;
        }

        if let Some(mut record) = prior_by_fingerprint.remove(&fingerprint) {
            record.id = candidate.id;
            fingerprints.add(&fingerprint);
            result.carried.push(record);
        } else if fingerprints.register(&fingerprint) {
            result.new.push(candidate);
        } else {
            tracing::debug!(
                "Skipping {}: fingerprint known but not in index",
                candidate.path().display()
            );
            result.skipped += 1;
        }
    }

    for fingerprint in fingerprints.snapshot() {
        if !seen.contains(&fingerprint) {
            fingerprints.remove(&fingerprint);
            result.removed.push(fingerprint);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn file(id: usize, name: &str, size: u64) -> FileRecord {
        let mtime = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FileRecord::new(id, name, "/docs", size, mtime)
    }

    fn described(mut record: FileRecord, text: &str, vector: Vec<f32>) -> FileRecord {
        record.description = text.to_string();
        record.embedding = vector;
        record
    }

    #[test]
    fn test_first_scan_is_all_new() {
        let store = FingerprintStore::new();
        let result = reconcile(vec![file(0, "a.txt", 5), file(1, "b.pdf", 9)], vec![], &store);

        assert_eq!(result.new.len(), 2);
        assert!(result.carried.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unchanged_files_are_carried() {
        let a = described(file(0, "a.txt", 5), "D1", vec![1.0, 0.0]);
        let store: FingerprintStore = [a.fingerprint()].into_iter().collect();

        let result = reconcile(vec![file(7, "a.txt", 5)], vec![a.clone()], &store);

        assert!(result.new.is_empty());
        assert!(result.is_unchanged());
        assert_eq!(result.carried.len(), 1);
        let carried = &result.carried[0];
        assert_eq!(carried.id, 7);
        assert_eq!(carried.description, "D1");
        assert_eq!(carried.embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_modified_file_is_new_and_old_fingerprint_removed() {
        let old = described(file(0, "a.txt", 5), "D1", vec![1.0, 0.0]);
        let store: FingerprintStore = [old.fingerprint()].into_iter().collect();

        let modified = file(0, "a.txt", 6);
        let result = reconcile(vec![modified.clone()], vec![old.clone()], &store);

        assert_eq!(result.new, vec![modified.clone()]);
        assert_eq!(result.removed, vec![old.fingerprint()]);
        assert!(store.exists(&modified.fingerprint()));
        assert!(!store.exists(&old.fingerprint()));
    }

    #[test]
    fn test_deleted_file_is_dropped() {
        let a = described(file(0, "a.txt", 5), "D1", vec![1.0, 0.0]);
        let b = described(file(1, "b.pdf", 9), "D2", vec![0.0, 1.0]);
        let store: FingerprintStore = [a.fingerprint(), b.fingerprint()].into_iter().collect();

        let result = reconcile(vec![file(0, "a.txt", 5)], vec![a.clone(), b.clone()], &store);

        assert_eq!(result.carried.len(), 1);
        assert_eq!(result.carried[0].name, "a.txt");
        assert_eq!(result.removed, vec![b.fingerprint()]);
        assert!(!store.exists(&b.fingerprint()));
    }

    #[test]
    fn test_duplicate_candidate_generated_once() {
        let store = FingerprintStore::new();
        let result = reconcile(vec![file(0, "a.txt", 5), file(1, "a.txt", 5)], vec![], &store);
        assert_eq!(result.new.len(), 1);
        assert_eq!(result.new[0].id, 0);
    }

    #[test]
    fn test_known_fingerprint_without_record_is_skipped() {
        let a = file(0, "a.txt", 5);
        let store: FingerprintStore = [a.fingerprint()].into_iter().collect();

        let result = reconcile(vec![a.clone()], vec![], &store);

        assert!(result.new.is_empty());
        assert!(result.carried.is_empty());
        assert_eq!(result.skipped, 1);
        assert!(store.exists(&a.fingerprint()));
    }

    #[test]
    fn test_carried_record_restores_missing_fingerprint() {
        let a = described(file(0, "a.txt", 5), "D1", vec![1.0]);
        let store = FingerprintStore::new();

        let result = reconcile(vec![file(0, "a.txt", 5)], vec![a.clone()], &store);

        assert_eq!(result.carried.len(), 1);
        assert!(store.exists(&a.fingerprint()));
    }
}
