//! Indexing logic: scan, reconcile, describe and embed new files, store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::content::StrategyTable;
use crate::gemini::GeminiClient;
use crate::pipeline::{GenerationPipeline, PipelineSettings};
use crate::reconcile::reconcile;
use crate::scan::Scanner;
use crate::service::{CancelFlag, GenerationService};
use crate::{Config, FileRecord, FingerprintStore, GenError, IndexStore, Result};

/// Progress events emitted during indexing.
#[derive(Debug, Clone)]
pub enum ProgressEvent<'a> {
    /// Scanning configured directories.
    Scanning { count: usize },
    /// A new file got its description (or failed to).
    Describing {
        current: usize,
        total: usize,
        name: &'a str,
    },
    /// A description got its embedding (or failed to).
    Embedding { current: usize, total: usize },
}

/// Type alias for progress callback.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Stats from an indexing run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub scanned: usize,
    pub carried: usize,
    pub new: usize,
    /// Known fingerprints with no record in the index
    pub skipped: usize,
    pub removed: usize,
    pub described: usize,
    pub description_failures: usize,
    pub embedded: usize,
    pub embedding_failures: usize,
}

/// The indexer orchestrates scanning, reconciliation, generation and storage.
pub struct Indexer {
    home: PathBuf,
    config: Config,
    services: Vec<Arc<dyn GenerationService>>,
    strategies: Option<StrategyTable>,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
}

impl Indexer {
    /// Indexer for the data directory `home`, talking to `services`.
    pub fn new(home: PathBuf, config: Config, services: Vec<Arc<dyn GenerationService>>) -> Self {
        Self {
            home,
            config,
            services,
            strategies: None,
            cancel: CancelFlag::new(),
            progress_callback: None,
        }
    }

    /// Load the config under `home` and build one Gemini client per API key.
    pub fn open(home: PathBuf) -> Result<Self> {
        let config = Config::load(&home)?;
        config.validate_for_index()?;
        let services = GeminiClient::pool(&config)?;
        Ok(Self::new(home, config, services))
    }

    /// Replace the default content-type strategy table.
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Abort the run (without saving) once `cancel` is raised.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set a callback to receive progress updates during indexing.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    fn emit_progress(&self, event: ProgressEvent) {
        if let Some(ref callback) = self.progress_callback {
            callback(event);
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring the index in line with the configured directories.
    ///
    /// Registers new fingerprints in `fingerprints` and drops vanished ones;
    /// the caller persists the store once this returns `Ok`. The index
    /// snapshot is only replaced at the very end.
    pub async fn index(&self, fingerprints: &FingerprintStore) -> Result<IndexStats> {
        self.config.validate_for_index()?;
        let mut pipeline = GenerationPipeline::new(
            self.services.clone(),
            PipelineSettings::from_config(&self.config),
        )?
        .with_cancel(self.cancel.clone());
        if let Some(strategies) = self.strategies.clone() {
            pipeline = pipeline.with_strategies(strategies);
        }

        let store = IndexStore::open(&self.home);
        let prior = store.load()?;

        let scanner = Scanner::from_config(&self.config).exclude(&self.home);
        let mut scanned = 0;
        let candidates: Vec<FileRecord> = scanner
            .iter()
            .inspect(|_| {
                scanned += 1;
                self.emit_progress(ProgressEvent::Scanning { count: scanned });
            })
            .collect();

        let reconciliation = reconcile(candidates, prior, fingerprints);
        let mut stats = IndexStats {
            scanned,
            carried: reconciliation.carried.len(),
            new: reconciliation.new.len(),
            skipped: reconciliation.skipped,
            removed: reconciliation.removed.len(),
            ..Default::default()
        };
        tracing::info!(
            "Scanned {} files: {} unchanged, {} new, {} removed",
            stats.scanned,
            stats.carried,
            stats.new,
            stats.removed
        );

        let (generated, report) = pipeline
            .run(reconciliation.new, self.progress_callback.as_ref())
            .await;
        if self.cancel.is_cancelled() {
            return Err(GenError::Index("indexing cancelled".to_string()));
        }

        stats.described = report.described;
        stats.description_failures = report.description_failures;
        stats.embedded = report.embedded;
        stats.embedding_failures = report.embedding_failures;

        let records = merge_in_scan_order(reconciliation.carried, generated);
        store.save(&records)?;

        tracing::info!(
            "Index holds {} files ({} described, {} embedded this run)",
            records.len(),
            stats.described,
            stats.embedded
        );
        Ok(stats)
    }

    /// Every record in the index.
    pub fn list(&self) -> Result<Vec<FileRecord>> {
        list(&self.home)
    }
}

/// Every record in the index under `home`.
pub fn list(home: &Path) -> Result<Vec<FileRecord>> {
    IndexStore::open(home).load()
}

/// Put records back in scan order (the order of the ids the scanner handed
/// out) and renumber them densely from 0.
fn merge_in_scan_order(carried: Vec<FileRecord>, generated: Vec<FileRecord>) -> Vec<FileRecord> {
    let mut records = carried;
    records.extend(generated);
    records.sort_by_key(|r| r.id);
    for (id, record) in records.iter_mut().enumerate() {
        record.id = id;
    }
    records
}
