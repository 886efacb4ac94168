/// Environment variable overriding the data directory
pub const HOME_ENV: &str = "GENCLI_HOME";

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Name of the data directory under the platform config dir
pub const APP_DIR: &str = "gencli";

/// Default model used to describe files
pub const DEFAULT_DESCRIBE_MODEL: &str = "gemini-1.5-flash";

/// Default model used to embed descriptions
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-004";

/// Minimum cosine similarity a search hit must exceed
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.35;

/// Concurrent requests per worker pool
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Deadline for preparing one file's description request (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Retries after the first attempt when rate limited
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// First backoff delay (milliseconds); doubles on each retry
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Upper bound for a single backoff delay (milliseconds)
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Videos above this size are described from metadata only (50MB)
pub const DEFAULT_MAX_VIDEO_BYTES: u64 = 50 * 1024 * 1024;

/// Length of the clip cut from a video before upload (seconds)
pub const DEFAULT_VIDEO_CLIP_SECS: u64 = 10;

/// Interval between upload status polls (seconds)
pub const UPLOAD_POLL_SECS: u64 = 10;

/// Max bytes of extracted text sent inline with a description request
pub const MAX_INLINE_TEXT_BYTES: usize = 512 * 1024;

/// Description stored when generation failed for good
pub const FAILED_DESCRIPTION: &str = "nil";
