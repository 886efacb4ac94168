//! Configuration handling for <home>/config.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    API_KEY_ENV, DEFAULT_BASE_DELAY_MS, DEFAULT_CONCURRENCY, DEFAULT_DESCRIBE_MODEL,
    DEFAULT_EMBED_MODEL, DEFAULT_MAX_RETRIES, DEFAULT_MAX_VIDEO_BYTES,
    DEFAULT_RELEVANCE_THRESHOLD, DEFAULT_TIMEOUT_SECS, DEFAULT_VIDEO_CLIP_SECS, GenError, Result,
    paths, service::RetryPolicy, store,
};

/// Configuration stored in <home>/config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root directories to index
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// File name suffixes to skip (e.g. ".log")
    #[serde(default)]
    pub skip_types: Vec<String>,

    /// File name prefixes to skip (e.g. ".")
    #[serde(default)]
    pub skip_files: Vec<String>,

    /// Minimum similarity a search hit must exceed
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Generation service API keys; one client per key
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Model that writes file descriptions
    #[serde(default = "default_describe_model")]
    pub describe_model: String,

    /// Model that embeds descriptions and queries
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Workers per pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for preparing one description request (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after a rate-limited attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Videos larger than this are described from metadata only
    #[serde(default = "default_max_video_bytes")]
    pub max_video_bytes: u64,

    /// Seconds of video uploaded for description
    #[serde(default = "default_video_clip_secs")]
    pub video_clip_secs: u64,
}

fn default_relevance_threshold() -> f32 {
    DEFAULT_RELEVANCE_THRESHOLD
}

fn default_describe_model() -> String {
    DEFAULT_DESCRIBE_MODEL.to_string()
}

fn default_embed_model() -> String {
    DEFAULT_EMBED_MODEL.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_video_bytes() -> u64 {
    DEFAULT_MAX_VIDEO_BYTES
}

fn default_video_clip_secs() -> u64 {
    DEFAULT_VIDEO_CLIP_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            skip_types: Vec::new(),
            skip_files: Vec::new(),
            relevance_threshold: default_relevance_threshold(),
            api_keys: Vec::new(),
            describe_model: default_describe_model(),
            embed_model: default_embed_model(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_video_bytes: default_max_video_bytes(),
            video_clip_secs: default_video_clip_secs(),
        }
    }
}

/// A batch of changes applied by `gencli config`.
#[derive(Debug, Clone, Default)]
pub struct ConfigEdit {
    pub add_directories: Vec<PathBuf>,
    pub remove_directories: Vec<PathBuf>,
    pub add_skip_types: Vec<String>,
    pub remove_skip_types: Vec<String>,
    pub add_skip_files: Vec<String>,
    pub remove_skip_files: Vec<String>,
    pub add_api_keys: Vec<String>,
    pub remove_api_keys: Vec<String>,
    pub relevance_threshold: Option<f32>,
}

impl Config {
    /// Load config from the data directory, falling back to defaults.
    pub fn load(home: &Path) -> Result<Self> {
        let path = paths::config_path(home);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the data directory.
    pub fn save(&self, home: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        store::write_atomic(&paths::config_path(home), content.as_bytes())
    }

    /// Load, apply `edit` and save.
    ///
    /// A first-time config with no directory given starts out indexing the
    /// current working directory.
    pub fn edit(home: &Path, mut edit: ConfigEdit) -> Result<Self> {
        let exists = paths::config_path(home).exists();
        let mut config = Self::load(home)?;

        if !exists && edit.add_directories.is_empty() {
            edit.add_directories.push(std::env::current_dir()?);
        }

        config.apply(edit)?;
        config.save(home)?;
        Ok(config)
    }

    /// Apply an edit in place. Added directories must exist.
    pub fn apply(&mut self, edit: ConfigEdit) -> Result<()> {
        for dir in edit.add_directories {
            if !dir.is_dir() {
                return Err(GenError::Config(format!(
                    "directory does not exist: {}",
                    dir.display()
                )));
            }
            let dir = dir.canonicalize()?;
            push_unique(&mut self.directories, dir);
        }
        for dir in &edit.remove_directories {
            let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
            self.directories.retain(|d| d != dir && *d != canonical);
        }

        for suffix in edit.add_skip_types {
            push_unique(&mut self.skip_types, suffix);
        }
        self.skip_types.retain(|s| !edit.remove_skip_types.contains(s));

        for prefix in edit.add_skip_files {
            push_unique(&mut self.skip_files, prefix);
        }
        self.skip_files.retain(|s| !edit.remove_skip_files.contains(s));

        for key in edit.add_api_keys {
            push_unique(&mut self.api_keys, key);
        }
        self.api_keys.retain(|k| !edit.remove_api_keys.contains(k));

        if let Some(threshold) = edit.relevance_threshold.filter(|t| *t > 0.0) {
            self.relevance_threshold = threshold;
        }

        Ok(())
    }

    /// API keys to use: configured keys, else `GEMINI_API_KEY`.
    pub fn resolve_api_keys(&self) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .api_keys
            .iter()
            .filter(|k| !k.trim().is_empty())
            .cloned()
            .collect();
        if !keys.is_empty() {
            return Ok(keys);
        }

        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(vec![key]),
            _ => Err(GenError::Config(format!(
                "no API keys configured; add one with `gencli config --add-api-key` or set {}",
                API_KEY_ENV
            ))),
        }
    }

    /// Checks that must pass before an index run touches anything.
    pub fn validate_for_index(&self) -> Result<()> {
        if self.directories.is_empty() {
            return Err(GenError::Config(
                "no directories configured; add one with `gencli config --add-dir`".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff policy for rate-limited calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }

    /// Deadline for preparing a single description request.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}
