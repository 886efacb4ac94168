//! Content-type dispatch: how to build a description request for a file
//!
//! A [`StrategyTable`] maps MIME categories to [`DescribeStrategy`]
//! implementations. Lookups never fail: anything unmatched goes to the
//! metadata-only strategy, which does not touch the file's content.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use mime_guess::Mime;
use tokio::io::AsyncReadExt;

use crate::service::{
    CancelFlag, DescribeRequest, GenerationService, ServiceError, UploadStatus,
    sleep_with_cancellation,
};
use crate::{
    Config, FileRecord, MAX_INLINE_TEXT_BYTES, UPLOAD_POLL_SECS, UploadState,
};

const PROMPT: &str =
    "Generate a description in less than 100 words about what this file is and what it is about";

/// Broad content categories, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Pdf,
    Image,
    Video,
    Metadata,
}

/// Knobs the strategies need.
#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub max_video_bytes: u64,
    pub video_clip_secs: u64,
    pub poll_interval: Duration,
}

impl ContentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_video_bytes: config.max_video_bytes,
            video_clip_secs: config.video_clip_secs.max(1),
            poll_interval: Duration::from_secs(UPLOAD_POLL_SECS),
        }
    }
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The upload made for one file, shared by every attempt at describing it.
///
/// Written as soon as the service accepts the bytes, so an attempt that
/// fails or times out afterwards still leaves the handle for the next one.
#[derive(Debug, Default)]
pub struct UploadSlot(Mutex<Option<UploadState>>);

impl UploadSlot {
    pub fn new(upload: Option<UploadState>) -> Self {
        Self(Mutex::new(upload))
    }

    pub fn get(&self) -> Option<UploadState> {
        self.lock().clone()
    }

    pub fn set(&self, upload: UploadState) {
        *self.lock() = Some(upload);
    }

    pub fn into_inner(self) -> Option<UploadState> {
        self.0
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, Option<UploadState>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything a strategy may use while preparing a request.
pub struct StrategyContext<'a> {
    pub service: &'a dyn GenerationService,
    pub cancel: &'a CancelFlag,
    pub settings: &'a ContentSettings,
    pub upload: &'a UploadSlot,
}

/// Builds the description request for one category of content.
#[async_trait]
pub trait DescribeStrategy: Send + Sync {
    fn kind(&self) -> ContentKind;

    async fn prepare(
        &self,
        file: &FileRecord,
        cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError>;
}

/// Which MIME types an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeMatch {
    /// Any subtype of a top-level type, e.g. `image`
    Type(String),
    /// One exact type, e.g. `application/pdf`
    Essence(String),
}

impl MimeMatch {
    pub fn type_(top: &str) -> Self {
        Self::Type(top.to_ascii_lowercase())
    }

    pub fn essence(essence: &str) -> Self {
        Self::Essence(essence.to_ascii_lowercase())
    }

    fn matches(&self, mime: &Mime) -> bool {
        match self {
            Self::Type(top) => mime.type_().as_str() == top,
            Self::Essence(essence) => mime.essence_str() == essence,
        }
    }
}

/// Ordered MIME -> strategy table with a metadata-only fallback.
#[derive(Clone)]
pub struct StrategyTable {
    entries: Vec<(MimeMatch, Arc<dyn DescribeStrategy>)>,
    fallback: Arc<dyn DescribeStrategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let text: Arc<dyn DescribeStrategy> = Arc::new(TextStrategy);
        let mut table = Self::empty();
        table.entries = vec![
            (MimeMatch::type_("text"), text.clone()),
            (MimeMatch::essence("application/json"), text.clone()),
            (MimeMatch::essence("application/xml"), text.clone()),
            (MimeMatch::essence("application/javascript"), text),
            (MimeMatch::essence("application/pdf"), Arc::new(PdfStrategy)),
            (MimeMatch::type_("image"), Arc::new(ImageStrategy)),
            (MimeMatch::type_("video"), Arc::new(VideoStrategy)),
        ];
        table
    }
}

impl StrategyTable {
    /// A table that sends everything to the metadata-only strategy.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            fallback: Arc::new(MetadataStrategy),
        }
    }

    /// Add an entry ahead of the existing ones, overriding any that match
    /// the same types.
    pub fn register(&mut self, matcher: MimeMatch, strategy: Arc<dyn DescribeStrategy>) {
        self.entries.insert(0, (matcher, strategy));
    }

    /// Strategy for a file, chosen by the MIME type of its extension.
    pub fn select(&self, file: &FileRecord) -> Arc<dyn DescribeStrategy> {
        guess_mime(&file.path())
            .and_then(|mime| {
                self.entries
                    .iter()
                    .find(|(matcher, _)| matcher.matches(&mime))
                    .map(|(_, strategy)| strategy.clone())
            })
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// The metadata-only strategy.
    pub fn fallback(&self) -> Arc<dyn DescribeStrategy> {
        self.fallback.clone()
    }
}

/// MIME type inferred from the file extension.
pub fn guess_mime(path: &Path) -> Option<Mime> {
    mime_guess::from_path(path).first()
}

/// Request built from metadata alone; never reads the file.
pub fn metadata_request(file: &FileRecord) -> DescribeRequest {
    DescribeRequest::text(format!(
        concat!(
            "{}, based on the metadata given:\n\n",
            "File Id: {}\nFile Path: {}\nFile Size: {}\nFile Modified Time: {}",
        ),
        PROMPT,
        file.id,
        file.path().display(),
        file.size,
        file.modified_time.to_rfc3339()
    ))
}

fn content_request(file: &FileRecord, content: &str) -> DescribeRequest {
    DescribeRequest::text(format!(
        "{}, based on the given content for file id {}:\n\n{}",
        PROMPT, file.id, content
    ))
}

/// Metadata-only description.
pub struct MetadataStrategy;

#[async_trait]
impl DescribeStrategy for MetadataStrategy {
    fn kind(&self) -> ContentKind {
        ContentKind::Metadata
    }

    async fn prepare(
        &self,
        file: &FileRecord,
        _cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError> {
        Ok(metadata_request(file))
    }
}

/// Inline text content, truncated to a fixed budget.
pub struct TextStrategy;

#[async_trait]
impl DescribeStrategy for TextStrategy {
    fn kind(&self) -> ContentKind {
        ContentKind::Text
    }

    async fn prepare(
        &self,
        file: &FileRecord,
        cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError> {
        cx.cancel.check()?;
        let mut bytes = Vec::new();
        tokio::fs::File::open(file.path())
            .await
            .map_err(content_error)?
            .take(MAX_INLINE_TEXT_BYTES as u64)
            .read_to_end(&mut bytes)
            .await
            .map_err(content_error)?;

        let text = String::from_utf8_lossy(&bytes);
        Ok(content_request(file, &text))
    }
}

/// Plain text extracted from a PDF.
pub struct PdfStrategy;

#[async_trait]
impl DescribeStrategy for PdfStrategy {
    fn kind(&self) -> ContentKind {
        ContentKind::Pdf
    }

    async fn prepare(
        &self,
        file: &FileRecord,
        cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError> {
        cx.cancel.check()?;
        let path = file.path();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
            .await
            .map_err(|e| ServiceError::Content(format!("PDF extraction aborted: {}", e)))?
            .map_err(|e| ServiceError::Content(format!("PDF extraction failed: {}", e)))?;
        cx.cancel.check()?;

        Ok(content_request(file, truncate(&text, MAX_INLINE_TEXT_BYTES)))
    }
}

/// Uploaded image referenced by handle.
pub struct ImageStrategy;

#[async_trait]
impl DescribeStrategy for ImageStrategy {
    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    async fn prepare(
        &self,
        file: &FileRecord,
        cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError> {
        let prompt = format!("{}, file id is {}", PROMPT, file.id);
        let path = file.path();
        let upload = upload_and_wait(cx, &path, &mime_of(&path)).await?;
        Ok(DescribeRequest::with_upload(&upload, prompt))
    }
}

/// The first few seconds of a video, cut with ffmpeg and uploaded.
pub struct VideoStrategy;

#[async_trait]
impl DescribeStrategy for VideoStrategy {
    fn kind(&self) -> ContentKind {
        ContentKind::Video
    }

    async fn prepare(
        &self,
        file: &FileRecord,
        cx: &StrategyContext<'_>,
    ) -> Result<DescribeRequest, ServiceError> {
        let prompt = format!("{}, based on the video file whose id is {}", PROMPT, file.id);
        if cx.upload.get().is_some() {
            let upload = wait_until_ready(cx, &file.path()).await?;
            return Ok(DescribeRequest::with_upload(&upload, prompt));
        }

        if file.size > cx.settings.max_video_bytes {
            tracing::debug!(
                "{} is too large to upload, describing from metadata",
                file.path().display()
            );
            return Ok(metadata_request(file));
        }

        let path = file.path();
        let clip_dir = tempfile::tempdir().map_err(content_error)?;
        let clip = clip_dir.path().join(format!(
            "clip.{}",
            path.extension().and_then(|e| e.to_str()).unwrap_or("mp4")
        ));
        trim_video(&path, &clip, cx.settings.video_clip_secs).await?;
        cx.cancel.check()?;

        let upload = upload_and_wait(cx, &clip, &mime_of(&path)).await?;
        Ok(DescribeRequest::with_upload(&upload, prompt))
    }
}

async fn trim_video(source: &Path, clip: &Path, secs: u64) -> Result<(), ServiceError> {
    let status = tokio::process::Command::new("ffmpeg")
        .arg("-y")
        .args(["-loglevel", "error"])
        .arg("-i")
        .arg(source)
        .args(["-t", &secs.to_string(), "-c", "copy"])
        .arg(clip)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| ServiceError::Content(format!("failed to run ffmpeg: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(ServiceError::Content(format!(
            "ffmpeg could not trim {} ({})",
            source.display(),
            status
        )))
    }
}

/// Upload `path` (unless an earlier attempt already did) and poll until the
/// service has processed it.
async fn upload_and_wait(
    cx: &StrategyContext<'_>,
    path: &Path,
    mime_type: &str,
) -> Result<UploadState, ServiceError> {
    if cx.upload.get().is_none() {
        cx.cancel.check()?;
        let upload = cx.service.upload(path, mime_type, cx.cancel).await?;
        cx.upload.set(upload);
    }
    wait_until_ready(cx, path).await
}

/// Poll the upload in `cx.upload` until it is usable.
async fn wait_until_ready(
    cx: &StrategyContext<'_>,
    path: &Path,
) -> Result<UploadState, ServiceError> {
    let upload = cx.upload.get().ok_or_else(|| {
        ServiceError::Upload(format!("no upload recorded for {}", path.display()))
    })?;

    loop {
        cx.cancel.check()?;
        match cx.service.upload_status(&upload.handle).await? {
            UploadStatus::Ready => return Ok(upload),
            UploadStatus::Failed => {
                return Err(ServiceError::Upload(format!(
                    "service could not process {}",
                    path.display()
                )));
            }
            UploadStatus::Processing => {
                tracing::debug!("Waiting for upload {} to be processed", upload.handle);
                sleep_with_cancellation(cx.cancel, cx.settings.poll_interval).await?;
            }
        }
    }
}

fn mime_of(path: &Path) -> String {
    guess_mime(path)
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn truncate(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn content_error(e: std::io::Error) -> ServiceError {
    ServiceError::Content(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Part;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records uploads; reports `Processing` a fixed number of times first,
    /// after failing a fixed number of status calls as rate limited.
    #[derive(Default)]
    struct UploadOnly {
        uploads: AtomicUsize,
        processing_polls: Mutex<usize>,
        rate_limited_polls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationService for UploadOnly {
        async fn describe(
            &self,
            _request: &DescribeRequest,
            _cancel: &CancelFlag,
        ) -> Result<String, ServiceError> {
            unreachable!("strategies never describe")
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
            unreachable!("strategies never embed")
        }

        async fn upload(
            &self,
            path: &Path,
            mime_type: &str,
            _cancel: &CancelFlag,
        ) -> Result<UploadState, ServiceError> {
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(UploadState {
                handle: format!("files/{}", n),
                uri: format!("mem://{}", path.display()),
                mime_type: mime_type.to_string(),
            })
        }

        async fn upload_status(&self, _handle: &str) -> Result<UploadStatus, ServiceError> {
            let limited = self
                .rate_limited_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if limited {
                return Err(ServiceError::RateLimited);
            }

            let mut polls = self.processing_polls.lock().unwrap();
            if *polls > 0 {
                *polls -= 1;
                Ok(UploadStatus::Processing)
            } else {
                Ok(UploadStatus::Ready)
            }
        }
    }

    fn record_in(dir: &Path, name: &str, size: u64) -> FileRecord {
        FileRecord::new(3, name, dir, size, Utc::now())
    }

    async fn prepare(
        strategy: &dyn DescribeStrategy,
        file: &FileRecord,
        service: &UploadOnly,
        settings: &ContentSettings,
        slot: &UploadSlot,
    ) -> Result<DescribeRequest, ServiceError> {
        let cancel = CancelFlag::new();
        let cx = StrategyContext {
            service,
            cancel: &cancel,
            settings,
            upload: slot,
        };
        strategy.prepare(file, &cx).await
    }

    fn cached_upload() -> UploadState {
        UploadState {
            handle: "files/old".into(),
            uri: "mem://old".into(),
            mime_type: "image/png".into(),
        }
    }

    #[test]
    fn test_select_by_mime_category() {
        let table = StrategyTable::default();
        let kind = |name: &str| table.select(&record_in(Path::new("/x"), name, 1)).kind();

        assert_eq!(kind("a.txt"), ContentKind::Text);
        assert_eq!(kind("notes.md"), ContentKind::Text);
        assert_eq!(kind("data.json"), ContentKind::Text);
        assert_eq!(kind("b.pdf"), ContentKind::Pdf);
        assert_eq!(kind("photo.PNG"), ContentKind::Image);
        assert_eq!(kind("clip.mp4"), ContentKind::Video);
        assert_eq!(kind("archive.unknownext"), ContentKind::Metadata);
        assert_eq!(kind("Makefile"), ContentKind::Metadata);
    }

    #[test]
    fn test_register_overrides_category() {
        let mut table = StrategyTable::default();
        table.register(MimeMatch::type_("image"), Arc::new(MetadataStrategy));
        let record = record_in(Path::new("/x"), "photo.png", 1);
        assert_eq!(table.select(&record).kind(), ContentKind::Metadata);
    }

    #[test]
    fn test_metadata_request_mentions_file() {
        let record = record_in(Path::new("/docs"), "b.bin", 42);
        let prompt = metadata_request(&record).prompt_text();
        assert!(prompt.contains("File Id: 3"));
        assert!(prompt.contains("b.bin"));
        assert!(prompt.contains("File Size: 42"));
    }

    #[tokio::test]
    async fn test_text_strategy_inlines_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let service = UploadOnly::default();
        let slot = UploadSlot::default();

        let request = prepare(
            &TextStrategy,
            &record_in(dir.path(), "a.txt", 5),
            &service,
            &ContentSettings::default(),
            &slot,
        )
        .await
        .unwrap();
        assert!(request.prompt_text().ends_with("hello"));
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_text_is_content_error() {
        let result = prepare(
            &TextStrategy,
            &record_in(Path::new("/no/such/dir"), "a.txt", 5),
            &UploadOnly::default(),
            &ContentSettings::default(),
            &UploadSlot::default(),
        )
        .await;
        assert!(matches!(result, Err(ServiceError::Content(_))));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_content_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"Not a real PDF file").unwrap();

        let result = prepare(
            &PdfStrategy,
            &record_in(dir.path(), "b.pdf", 19),
            &UploadOnly::default(),
            &ContentSettings::default(),
            &UploadSlot::default(),
        )
        .await;
        assert!(matches!(result, Err(ServiceError::Content(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_upload_waits_until_ready() {
        let service = UploadOnly {
            processing_polls: Mutex::new(2),
            ..Default::default()
        };
        let slot = UploadSlot::default();

        let request = prepare(
            &ImageStrategy,
            &record_in(Path::new("/pics"), "cat.png", 10),
            &service,
            &ContentSettings::default(),
            &slot,
        )
        .await
        .unwrap();

        let upload = slot.get().unwrap();
        assert_eq!(upload.mime_type, "image/png");
        assert!(request.parts.contains(&Part::File {
            uri: upload.uri.clone(),
            mime_type: upload.mime_type.clone(),
        }));
        assert_eq!(service.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(*service.processing_polls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cached_upload_is_not_repeated() {
        let service = UploadOnly::default();
        let slot = UploadSlot::new(Some(cached_upload()));

        let request = prepare(
            &ImageStrategy,
            &record_in(Path::new("/pics"), "cat.png", 10),
            &service,
            &ContentSettings::default(),
            &slot,
        )
        .await
        .unwrap();

        assert_eq!(service.uploads.load(Ordering::SeqCst), 0);
        assert!(request.parts.iter().any(|p| matches!(
            p,
            Part::File { uri, .. } if uri == "mem://old"
        )));
    }

    #[tokio::test]
    async fn test_upload_survives_rate_limited_status_check() {
        let service = UploadOnly {
            rate_limited_polls: AtomicUsize::new(1),
            ..Default::default()
        };
        let slot = UploadSlot::default();
        let record = record_in(Path::new("/pics"), "cat.png", 10);
        let settings = ContentSettings::default();

        let first = prepare(&ImageStrategy, &record, &service, &settings, &slot).await;
        assert_eq!(first, Err(ServiceError::RateLimited));
        assert_eq!(slot.get().unwrap().handle, "files/0");

        prepare(&ImageStrategy, &record, &service, &settings, &slot)
            .await
            .unwrap();
        assert_eq!(service.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_video_falls_back_to_metadata() {
        let service = UploadOnly::default();
        let settings = ContentSettings {
            max_video_bytes: 100,
            ..Default::default()
        };

        let record = record_in(Path::new("/videos"), "big.mp4", 101);
        let request = prepare(
            &VideoStrategy,
            &record,
            &service,
            &settings,
            &UploadSlot::default(),
        )
        .await
        .unwrap();
        assert_eq!(request, metadata_request(&record));
        assert_eq!(service.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_video_upload_skips_trimming() {
        let service = UploadOnly::default();
        let slot = UploadSlot::new(Some(cached_upload()));

        // No such file on disk: a fresh attempt would fail in ffmpeg.
        let record = record_in(Path::new("/no/such/videos"), "clip.mp4", 10);
        let request = prepare(
            &VideoStrategy,
            &record,
            &service,
            &ContentSettings::default(),
            &slot,
        )
        .await
        .unwrap();

        assert!(request.parts.iter().any(|p| matches!(p, Part::File { .. })));
        assert_eq!(service.uploads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("hello", 10), "hello");
    }
}
