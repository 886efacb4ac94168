//! Gemini REST client implementing [`GenerationService`]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::service::{
    CancelFlag, DescribeRequest, GenerationService, Part, ServiceError, UploadStatus,
};
use crate::{Config, Result, UploadState};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Max characters of an error body kept in `ServiceError::Http`
const MAX_ERROR_BODY: usize = 500;

/// One API key's worth of access to the Gemini API.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    describe_model: String,
    embed_model: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("describe_model", &self.describe_model)
            .field("embed_model", &self.embed_model)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            describe_model: config.describe_model.clone(),
            embed_model: config.embed_model.clone(),
        })
    }

    /// One client per resolved API key.
    pub fn pool(config: &Config) -> Result<Vec<Arc<dyn GenerationService>>> {
        config
            .resolve_api_keys()?
            .into_iter()
            .map(|key| -> Result<Arc<dyn GenerationService>> {
                Ok(Arc::new(Self::new(key, config)?))
            })
            .collect()
    }

    /// Point at a different API host (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/v1beta/models/{}:{}", self.base_url, model, method)
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn describe(
        &self,
        request: &DescribeRequest,
        cancel: &CancelFlag,
    ) -> std::result::Result<String, ServiceError> {
        cancel.check()?;
        let body = GenerateRequest::from(request);
        let response: GenerateResponse = send_json(
            self.http
                .post(self.model_url(&self.describe_model, "generateContent"))
                .query(&[("key", &self.api_key)])
                .json(&body),
        )
        .await?;
        cancel.check()?;

        response.text().ok_or_else(|| {
            ServiceError::Content("generation service returned no candidates".to_string())
        })
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
        let model = format!(
            "models/{}",
            self.embed_model.trim_start_matches("models/")
        );
        let body = EmbedRequest {
            model,
            content: Content {
                role: None,
                parts: vec![WirePart::text(text)],
            },
        };
        let response: EmbedResponse = send_json(
            self.http
                .post(self.model_url(&self.embed_model, "embedContent"))
                .query(&[("key", &self.api_key)])
                .json(&body),
        )
        .await?;

        if response.embedding.values.is_empty() {
            return Err(ServiceError::Content(
                "generation service returned an empty embedding".to_string(),
            ));
        }
        Ok(response.embedding.values)
    }

    async fn upload(
        &self,
        path: &Path,
        mime_type: &str,
        cancel: &CancelFlag,
    ) -> std::result::Result<UploadState, ServiceError> {
        cancel.check()?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::Content(e.to_string()))?;
        cancel.check()?;

        let response: UploadResponse = send_json(
            self.http
                .post(format!("{}/upload/v1beta/files", self.base_url))
                .query(&[("key", self.api_key.as_str()), ("uploadType", "media")])
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .body(bytes),
        )
        .await?;

        let file = response.file;
        Ok(UploadState {
            handle: file.name,
            uri: file.uri,
            mime_type: file.mime_type.unwrap_or_else(|| mime_type.to_string()),
        })
    }

    async fn upload_status(&self, handle: &str) -> std::result::Result<UploadStatus, ServiceError> {
        let file: WireFile = send_json(
            self.http
                .get(format!("{}/v1beta/{}", self.base_url, handle))
                .query(&[("key", &self.api_key)]),
        )
        .await?;
        Ok(file.status())
    }
}

async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
) -> std::result::Result<T, ServiceError> {
    let response = request
        .send()
        .await
        .map_err(|e| ServiceError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(MAX_ERROR_BODY).collect();
        return Err(ServiceError::from_status(status.as_u16(), message));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| ServiceError::Transport(format!("invalid response body: {}", e)))
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

impl From<&DescribeRequest> for GenerateRequest {
    fn from(request: &DescribeRequest) -> Self {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => WirePart::text(text),
                Part::File { uri, mime_type } => WirePart {
                    text: None,
                    file_data: Some(FileData {
                        mime_type: mime_type.clone(),
                        file_uri: uri.clone(),
                    }),
                },
            })
            .collect();

        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
}

impl WirePart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            file_data: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateResponse {
    /// Text of every part of every candidate, concatenated.
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.text.as_deref())
            .collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: WireFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl WireFile {
    fn status(&self) -> UploadStatus {
        match self.state.as_deref() {
            Some("PROCESSING") => UploadStatus::Processing,
            Some("FAILED") => UploadStatus::Failed,
            // ACTIVE, or no state reported at all
            _ => UploadStatus::Ready,
        }
    }
}
