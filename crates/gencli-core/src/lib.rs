//! gencli-core: model-described file indexing and semantic search
//!
//! Walks configured directories, asks an external generation service for a
//! short description and an embedding of every new file, persists the results
//! as a JSON snapshot and answers "which file best matches this query" with an
//! exhaustive cosine-similarity scan.

pub mod config;
pub mod consts;
pub mod content;
pub mod fingerprint;
pub mod gemini;
pub mod index;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod record;
pub mod scan;
pub mod search;
pub mod service;
pub mod store;

pub use config::{Config, ConfigEdit};
pub use consts::*;
pub use fingerprint::FingerprintStore;
pub use index::{IndexStats, Indexer};
pub use record::{FileRecord, UploadState};
pub use search::{SearchHit, Searcher};
pub use service::{CancelFlag, GenerationService, RetryPolicy, ServiceError};
pub use store::IndexStore;

#[derive(Debug, thiserror::Error)]
pub enum GenError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GenError>;
