//! The persisted unit of the index

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::FAILED_DESCRIPTION;

/// A file handed to the generation service, kept so retries reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    /// Opaque handle the service uses to identify the upload
    pub handle: String,
    /// URI referenced from description requests
    pub uri: String,
    /// MIME type the content was uploaded as
    pub mime_type: String,
}

/// One indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Position in the scan that produced this record (display only)
    pub id: usize,
    pub name: String,
    /// Absolute parent directory
    pub directory: PathBuf,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    /// Generated description; empty until generated, `"nil"` when generation failed
    #[serde(default)]
    pub description: String,
    /// Embedding of `description`; empty until embedded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_state: Option<UploadState>,
}

impl FileRecord {
    /// A record stub for a freshly scanned file.
    pub fn new(
        id: usize,
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        size: u64,
        modified_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            directory: directory.into(),
            size,
            modified_time,
            description: String::new(),
            embedding: Vec::new(),
            upload_state: None,
        }
    }

    /// Full path of the file on disk.
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// Content fingerprint: blake3 over `name|directory|size|modified_time`.
    ///
    /// The sole identity used for dedup; any change to the four fields is a
    /// different file as far as the index is concerned.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.name, &self.directory, self.size, &self.modified_time)
    }

    /// True when the description came back from the service.
    pub fn has_description(&self) -> bool {
        !self.description.is_empty() && self.description != FAILED_DESCRIPTION
    }

    /// True when the record can take part in a similarity search.
    pub fn is_searchable(&self) -> bool {
        self.has_description() && !self.embedding.is_empty()
    }

    /// Downgrade to the failure sentinel.
    pub fn mark_failed(&mut self) {
        self.description = FAILED_DESCRIPTION.to_string();
        self.embedding.clear();
    }
}

/// Fingerprint of a file's identity-defining metadata.
pub fn fingerprint_of(
    name: &str,
    directory: &Path,
    size: u64,
    modified_time: &DateTime<Utc>,
) -> String {
    let data = format!(
        "{}|{}|{}|{}",
        name,
        directory.display(),
        size,
        modified_time.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    blake3::hash(data.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> FileRecord {
        let mtime = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        FileRecord::new(0, "a.txt", "/home/me/docs", 5, mtime)
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
        assert_eq!(sample().fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_generated_fields() {
        let mut other = sample();
        other.id = 42;
        other.description = "D1".into();
        other.embedding = vec![1.0, 0.0];
        assert_eq!(sample().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_identity_fields() {
        let base = sample().fingerprint();

        let mut resized = sample();
        resized.size = 6;
        assert_ne!(base, resized.fingerprint());

        let mut touched = sample();
        touched.modified_time += chrono::Duration::nanoseconds(1);
        assert_ne!(base, touched.fingerprint());

        let mut moved = sample();
        moved.directory = PathBuf::from("/home/me/other");
        assert_ne!(base, moved.fingerprint());
    }

    #[test]
    fn test_fingerprint_survives_json() {
        let mut record = sample();
        record.modified_time += chrono::Duration::nanoseconds(123_456_789);
        let json = serde_json::to_string(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.fingerprint(), back.fingerprint());
    }

    #[test]
    fn test_searchable_needs_description_and_embedding() {
        let mut record = sample();
        assert!(!record.is_searchable());

        record.embedding = vec![1.0];
        assert!(!record.is_searchable());

        record.description = "D1".into();
        assert!(record.is_searchable());

        record.mark_failed();
        assert!(!record.has_description());
        assert!(!record.is_searchable());
    }
}
