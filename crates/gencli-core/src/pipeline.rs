//! Generation Pipeline: describe and embed new files with bounded concurrency
//!
//! Two pools of fixed size run one after the other. The first turns each new
//! file into a description, the second embeds every successful description.
//! Both pull from a shared queue and push to a shared results channel, so
//! output order is not input order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::content::{
    ContentSettings, StrategyContext, StrategyTable, UploadSlot, metadata_request,
};
use crate::index::{ProgressCallback, ProgressEvent};
use crate::service::{
    CancelFlag, DescribeRequest, GenerationService, RetryPolicy, ServiceError, retry_with_backoff,
};
use crate::{Config, FileRecord, GenError, Result};

/// Pool sizes, deadlines and backoff for one run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub concurrency: usize,
    /// Deadline for preparing one file's description request
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub content: ContentSettings,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            timeout: config.timeout(),
            retry: config.retry_policy(),
            content: ContentSettings::from_config(config),
        }
    }
}

/// Counts from one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub described: usize,
    pub description_failures: usize,
    pub embedded: usize,
    pub embedding_failures: usize,
}

pub struct GenerationPipeline {
    services: Vec<Arc<dyn GenerationService>>,
    strategies: Arc<StrategyTable>,
    settings: Arc<PipelineSettings>,
    cancel: CancelFlag,
}

impl GenerationPipeline {
    /// Pipeline over one or more service clients; worker `i` uses client
    /// `i % services.len()`.
    pub fn new(
        services: Vec<Arc<dyn GenerationService>>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        if services.is_empty() {
            return Err(GenError::Config(
                "generation pipeline needs at least one service client".to_string(),
            ));
        }
        Ok(Self {
            services,
            strategies: Arc::new(StrategyTable::default()),
            settings: Arc::new(settings),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = Arc::new(strategies);
        self
    }

    /// Share a flag that aborts the whole run when raised.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Describe, then embed, every file. Failures never drop a file: it
    /// comes back with the failure sentinel or without an embedding.
    pub async fn run(
        &self,
        files: Vec<FileRecord>,
        progress: Option<&ProgressCallback>,
    ) -> (Vec<FileRecord>, PipelineReport) {
        let mut report = PipelineReport::default();
        if files.is_empty() {
            return (files, report);
        }

        let described = self.describe_all(files, progress).await;
        let (to_embed, failed): (Vec<_>, Vec<_>) =
            described.into_iter().partition(|f| f.has_description());
        report.described = to_embed.len();
        report.description_failures = failed.len();

        let mut output = self.embed_all(to_embed, progress).await;
        report.embedded = output.iter().filter(|f| !f.embedding.is_empty()).count();
        report.embedding_failures = report.described - report.embedded;

        output.extend(failed);
        (output, report)
    }

    async fn describe_all(
        &self,
        files: Vec<FileRecord>,
        progress: Option<&ProgressCallback>,
    ) -> Vec<FileRecord> {
        let services = self.services.clone();
        let strategies = self.strategies.clone();
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();

        let total = files.len();
        let mut done = 0;
        run_pool(
            files,
            self.settings.concurrency,
            move |worker, file| {
                let service = services[worker % services.len()].clone();
                let strategies = strategies.clone();
                let settings = settings.clone();
                let cancel = cancel.clone();
                async move { describe_file(service, strategies, settings, cancel, file).await }
            },
            |file| {
                done += 1;
                if let Some(callback) = progress {
                    callback(ProgressEvent::Describing {
                        current: done,
                        total,
                        name: &file.name,
                    });
                }
            },
        )
        .await
    }

    async fn embed_all(
        &self,
        files: Vec<FileRecord>,
        progress: Option<&ProgressCallback>,
    ) -> Vec<FileRecord> {
        let services = self.services.clone();
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();

        let total = files.len();
        let mut done = 0;
        run_pool(
            files,
            self.settings.concurrency,
            move |worker, file| {
                let service = services[worker % services.len()].clone();
                let settings = settings.clone();
                let cancel = cancel.clone();
                async move { embed_file(service, settings, cancel, file).await }
            },
            |_| {
                done += 1;
                if let Some(callback) = progress {
                    callback(ProgressEvent::Embedding {
                        current: done,
                        total,
                    });
                }
            },
        )
        .await
    }
}

/// Fixed worker count over a shared queue; returns once every worker has
/// joined. `on_result` sees results as they arrive.
async fn run_pool<W, Fut>(
    files: Vec<FileRecord>,
    concurrency: usize,
    work: W,
    mut on_result: impl FnMut(&FileRecord),
) -> Vec<FileRecord>
where
    W: Fn(usize, FileRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FileRecord> + Send + 'static,
{
    let total = files.len();
    if total == 0 {
        return files;
    }

    let (job_tx, job_rx) = mpsc::unbounded_channel();
    for file in files {
        // The receiver is alive until the workers below finish.
        let _ = job_tx.send(file);
    }
    drop(job_tx);

    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let work = Arc::new(work);
    let mut workers = JoinSet::new();

    for worker in 0..concurrency.max(1).min(total) {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let work = work.clone();
        workers.spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some(file) = next else { break };
                if result_tx.send(work(worker, file).await).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut results = Vec::with_capacity(total);
    while let Some(file) = result_rx.recv().await {
        on_result(&file);
        results.push(file);
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Generation worker failed: {}", e);
        }
    }

    results
}

async fn describe_file(
    service: Arc<dyn GenerationService>,
    strategies: Arc<StrategyTable>,
    settings: Arc<PipelineSettings>,
    cancel: CancelFlag,
    mut file: FileRecord,
) -> FileRecord {
    let upload = UploadSlot::new(file.upload_state.clone());
    let result = {
        let service = &*service;
        let strategies = &*strategies;
        let settings = &*settings;
        let cancel_ref = &cancel;
        let file_ref = &file;
        let upload_ref = &upload;
        retry_with_backoff(&settings.retry, &cancel, move || {
            attempt_describe(service, strategies, settings, cancel_ref, file_ref, upload_ref)
        })
        .await
    };

    file.upload_state = upload.into_inner();

    match result {
        Ok(description) if !description.trim().is_empty() => {
            tracing::debug!("Described {}", file.path().display());
            file.description = description;
        }
        Ok(_) => {
            tracing::warn!("Empty description for {}", file.path().display());
            file.mark_failed();
        }
        Err(e) => {
            tracing::warn!("Failed to describe {}: {}", file.path().display(), e);
            file.mark_failed();
        }
    }
    file
}

/// One attempt: prepare the request (under the deadline) then describe it.
async fn attempt_describe(
    service: &dyn GenerationService,
    strategies: &StrategyTable,
    settings: &PipelineSettings,
    cancel: &CancelFlag,
    file: &FileRecord,
    upload: &UploadSlot,
) -> std::result::Result<String, ServiceError> {
    let request = prepare_with_deadline(service, strategies, settings, file, upload).await?;
    service.describe(&request, cancel).await
}

/// Run the file's strategy with a deadline. On expiry the attempt's flag is
/// raised and its future dropped; whatever it would have produced is
/// discarded and the metadata-only request is used instead (an upload that
/// already went through stays in `upload` for later attempts). Permanent
/// content errors take the same fallback; rate limiting is passed up so the
/// caller can back off.
async fn prepare_with_deadline(
    service: &dyn GenerationService,
    strategies: &StrategyTable,
    settings: &PipelineSettings,
    file: &FileRecord,
    upload: &UploadSlot,
) -> std::result::Result<DescribeRequest, ServiceError> {
    let strategy = strategies.select(file);
    let attempt = CancelFlag::new();
    let cx = StrategyContext {
        service,
        cancel: &attempt,
        settings: &settings.content,
        upload,
    };

    match tokio::time::timeout(settings.timeout, strategy.prepare(file, &cx)).await {
        Ok(Ok(request)) => Ok(request),
        Ok(Err(e)) if e.is_rate_limited() => Err(e),
        Ok(Err(e)) => {
            tracing::warn!(
                "Using metadata for {} ({:?} content failed: {})",
                file.path().display(),
                strategy.kind(),
                e
            );
            Ok(metadata_request(file))
        }
        Err(_) => {
            attempt.cancel();
            tracing::warn!(
                "Preparing {} took longer than {:?}, using metadata",
                file.path().display(),
                settings.timeout
            );
            Ok(metadata_request(file))
        }
    }
}

async fn embed_file(
    service: Arc<dyn GenerationService>,
    settings: Arc<PipelineSettings>,
    cancel: CancelFlag,
    mut file: FileRecord,
) -> FileRecord {
    let result = {
        let service = &*service;
        let text = file.description.as_str();
        retry_with_backoff(&settings.retry, &cancel, move || service.embed(text)).await
    };

    match result {
        Ok(embedding) => file.embedding = embedding,
        Err(e) => {
            tracing::warn!("Failed to embed {}: {}", file.path().display(), e);
            file.embedding.clear();
        }
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UploadState;
    use crate::service::UploadStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Describes slowly, tracking how many calls overlap.
    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_embed: bool,
    }

    #[async_trait]
    impl GenerationService for Slow {
        async fn describe(
            &self,
            request: &DescribeRequest,
            _cancel: &CancelFlag,
        ) -> std::result::Result<String, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("about {}", request.prompt_text().len()))
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
            if self.fail_embed {
                Err(ServiceError::from_status(400, "bad request"))
            } else {
                Ok(vec![1.0, 2.0])
            }
        }

        async fn upload(
            &self,
            _path: &Path,
            _mime_type: &str,
            _cancel: &CancelFlag,
        ) -> std::result::Result<UploadState, ServiceError> {
            unreachable!("metadata-only table never uploads")
        }

        async fn upload_status(
            &self,
            _handle: &str,
        ) -> std::result::Result<UploadStatus, ServiceError> {
            unreachable!("metadata-only table never uploads")
        }
    }

    fn settings(concurrency: usize) -> PipelineSettings {
        PipelineSettings {
            concurrency,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            content: ContentSettings::default(),
        }
    }

    fn files(n: usize) -> Vec<FileRecord> {
        (0..n)
            .map(|i| FileRecord::new(i, format!("f{}.bin", i), "/nowhere", 1, Utc::now()))
            .collect()
    }

    fn pipeline(service: Arc<Slow>, concurrency: usize) -> GenerationPipeline {
        let service: Arc<dyn GenerationService> = service;
        GenerationPipeline::new(vec![service], settings(concurrency))
            .unwrap()
            .with_strategies(StrategyTable::empty())
    }

    #[test]
    fn test_needs_a_service() {
        assert!(GenerationPipeline::new(Vec::new(), settings(1)).is_err());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_nothing_dropped() {
        let service = Arc::new(Slow::default());
        let (out, report) = pipeline(service.clone(), 3).run(files(10), None).await;

        let mut ids: Vec<_> = out.iter().map(|f| f.id).collect();
        ids.sort();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert!(service.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(report.described, 10);
        assert_eq!(report.embedded, 10);
        assert!(out.iter().all(|f| f.is_searchable()));
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_description() {
        let service = Arc::new(Slow {
            fail_embed: true,
            ..Default::default()
        });
        let (out, report) = pipeline(service, 2).run(files(2), None).await;

        assert_eq!(report.described, 2);
        assert_eq!(report.embedded, 0);
        assert_eq!(report.embedding_failures, 2);
        assert!(out.iter().all(|f| f.has_description() && f.embedding.is_empty()));
    }

    #[tokio::test]
    async fn test_progress_reports_every_file() {
        let service = Arc::new(Slow::default());
        let described = Arc::new(AtomicUsize::new(0));
        let embedded = Arc::new(AtomicUsize::new(0));
        let callback: ProgressCallback = Box::new({
            let described = described.clone();
            let embedded = embedded.clone();
            move |event| match event {
                ProgressEvent::Describing { .. } => {
                    described.fetch_add(1, Ordering::SeqCst);
                }
                ProgressEvent::Embedding { .. } => {
                    embedded.fetch_add(1, Ordering::SeqCst);
                }
                ProgressEvent::Scanning { .. } => {}
            }
        });

        pipeline(service, 4).run(files(5), Some(&callback)).await;
        assert_eq!(described.load(Ordering::SeqCst), 5);
        assert_eq!(embedded.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cancelled_run_marks_files_failed() {
        let service = Arc::new(Slow::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (out, report) = pipeline(service, 2)
            .with_cancel(cancel)
            .run(files(3), None)
            .await;

        assert_eq!(out.len(), 3);
        assert_eq!(report.description_failures, 3);
    }
}
