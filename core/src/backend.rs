/// Request/response client for the chat backend
///
/// Endpoints:
///   GET  /api/get_messages?pair_id=<id>   history snapshot
///   POST /api/upload_image                multipart field `image`
///   POST /api/analyze_text                {text, role, context}
///   POST /api/analyze_emoji               {image_url, role, context}
///   POST /api/search_emojis               {text, limit}
use crate::config::Config;
use crate::error::{ChatError, Result, TransportError};
use crate::media::MediaFile;
use crate::protocol::{
    AnalysisResponse, AnalyzeEmojiRequest, AnalyzeTextRequest, ErrorBody, InboundFrame,
    SearchEmojisRequest, SearchEmojisResponse, UploadResponse,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tracing::debug;

/// The external service holding history, media and analysis
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Ordered history rows for one conversation
    async fn fetch_history(&self, pair_id: &str) -> std::result::Result<Vec<InboundFrame>, TransportError>;

    /// Store an image and return its URL
    async fn upload_image(&self, file: &MediaFile) -> std::result::Result<String, TransportError>;

    async fn analyze_text(
        &self,
        request: &AnalyzeTextRequest,
    ) -> std::result::Result<AnalysisResponse, TransportError>;

    async fn analyze_emoji(
        &self,
        request: &AnalyzeEmojiRequest,
    ) -> std::result::Result<AnalysisResponse, TransportError>;

    /// Emoji image URLs matching `text`
    async fn search_emojis(&self, text: &str, limit: usize) -> std::result::Result<Vec<String>, TransportError>;
}

/// `ChatBackend` over HTTP
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base(config.http_base(), config)
    }

    /// Client for an explicit base URL such as `http://127.0.0.1:8000`
    pub fn with_base(base: impl Into<String>, config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> std::result::Result<T, TransportError>
    where
        B: serde::Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!("POST {}", path);
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(network)?;
        decode(response).await
    }
}

fn network(e: reqwest::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

/// Decode a JSON body, surfacing the error detail of non-2xx responses
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> std::result::Result<T, TransportError> {
    let status = response.status();
    let body = response.bytes().await.map_err(network)?;

    if !status.is_success() {
        let detail = serde_json::from_slice::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.detail_text());
        return Err(TransportError::Status {
            status: status.as_u16(),
            detail,
        });
    }

    serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn fetch_history(&self, pair_id: &str) -> std::result::Result<Vec<InboundFrame>, TransportError> {
        let path = format!("/api/get_messages?pair_id={}", urlencoding::encode(pair_id));
        debug!("GET {}", path);
        let response = self.client.get(self.url(&path)).send().await.map_err(network)?;
        decode(response).await
    }

    async fn upload_image(&self, file: &MediaFile) -> std::result::Result<String, TransportError> {
        let part = Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| TransportError::Malformed(format!("invalid mime type: {}", e)))?;
        let form = Form::new().part("image", part);

        debug!("POST /api/upload_image ({} bytes)", file.bytes.len());
        let response = self
            .client
            .post(self.url("/api/upload_image"))
            .multipart(form)
            .send()
            .await
            .map_err(network)?;
        let uploaded: UploadResponse = decode(response).await?;
        Ok(uploaded.image_url)
    }

    async fn analyze_text(
        &self,
        request: &AnalyzeTextRequest,
    ) -> std::result::Result<AnalysisResponse, TransportError> {
        self.post_json("/api/analyze_text", request).await
    }

    async fn analyze_emoji(
        &self,
        request: &AnalyzeEmojiRequest,
    ) -> std::result::Result<AnalysisResponse, TransportError> {
        self.post_json("/api/analyze_emoji", request).await
    }

    async fn search_emojis(&self, text: &str, limit: usize) -> std::result::Result<Vec<String>, TransportError> {
        let request = SearchEmojisRequest {
            text: text.to_string(),
            limit,
        };
        let found: SearchEmojisResponse = self.post_json("/api/search_emojis", &request).await?;
        Ok(found.emojis)
    }
}
