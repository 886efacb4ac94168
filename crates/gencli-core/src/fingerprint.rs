//! Fingerprint Store: the set of fingerprints already sent for generation

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::{Result, store};

/// Concurrent set of file fingerprints, persisted as a sorted JSON array.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    set: Mutex<HashSet<String>>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved set. A missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        let digests: Vec<String> = serde_json::from_str(&content)?;
        Ok(digests.into_iter().collect())
    }

    /// Write the whole set, replacing any previous file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        store::write_atomic(path, content.as_bytes())
    }

    pub fn add(&self, fingerprint: &str) {
        self.lock().insert(fingerprint.to_string());
    }

    /// Add `fingerprint`, returning false if it was already present.
    pub fn register(&self, fingerprint: &str) -> bool {
        self.lock().insert(fingerprint.to_string())
    }

    pub fn exists(&self, fingerprint: &str) -> bool {
        self.lock().contains(fingerprint)
    }

    pub fn remove(&self, fingerprint: &str) -> bool {
        self.lock().remove(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted copy of the current contents.
    pub fn snapshot(&self) -> Vec<String> {
        let mut digests: Vec<String> = self.lock().iter().cloned().collect();
        digests.sort();
        digests
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FromIterator<String> for FingerprintStore {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            set: Mutex::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_exists_remove() {
        let store = FingerprintStore::new();
        assert!(!store.exists("abc"));

        store.add("abc");
        assert!(store.exists("abc"));
        assert!(!store.register("abc"));
        assert!(store.register("def"));
        assert_eq!(store.len(), 2);

        assert!(store.remove("abc"));
        assert!(!store.remove("abc"));
        assert_eq!(store.snapshot(), vec!["def".to_string()]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::load(&dir.path().join("fingerprints.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints.json");

        let store: FingerprintStore = ["b".to_string(), "a".to_string()].into_iter().collect();
        store.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let on_disk: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, vec!["a".to_string(), "b".to_string()]);

        let loaded = FingerprintStore::load(&path).unwrap();
        assert!(loaded.exists("a") && loaded.exists("b"));
    }

    #[test]
    fn test_concurrent_register_admits_one_winner() {
        let store = Arc::new(FingerprintStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.register("same"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
