// Gemini API client and native wire types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::proxy::credentials::Credential;

const API_VERSION: &str = "v1beta";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
}

// ============ Request types ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiPart {
    pub text: String,
}

impl GeminiContent {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![GeminiPart { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl GeminiGenerationConfig {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedContentRequest {
    pub model: String,
    pub content: GeminiContent,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchEmbedContentsRequest {
    pub requests: Vec<EmbedContentRequest>,
}

// ============ Response types ============

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<CandidatePart>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CandidatePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
}

impl Candidate {
    /// Visible text of the candidate, thought parts excluded.
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEmbedding {
    #[serde(default, alias = "value")]
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedContentResponse {
    pub embedding: ContentEmbedding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEmbedContentsResponse {
    #[serde(default)]
    pub embeddings: Vec<ContentEmbedding>,
}

// ============ Client ============

#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: String,
    request_timeout: Duration,
    http_client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, UpstreamError> {
        // No client-wide timeout: it would also cut long-running streams.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            http_client,
        })
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        format!(
            "{}/{}/models/{}:{}",
            self.base_url,
            API_VERSION,
            urlencoding::encode(model),
            action
        )
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        credential: &Credential,
        payload: &T,
    ) -> Result<Bytes, UpstreamError> {
        let response = self
            .http_client
            .post(url)
            .bearer_auth(credential.expose())
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        tracing::debug!("Gemini API response status {} ({} bytes)", status, body.len());

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(body)
    }

    /// Non-streaming generation. Returns the raw success body for the translator.
    pub async fn generate_content(
        &self,
        credential: &Credential,
        model: &str,
        payload: &GenerateContentRequest,
    ) -> Result<Bytes, UpstreamError> {
        let url = self.model_url(model, "generateContent");
        tracing::debug!("POST {} with credential {}", url, credential);
        self.post_json(&url, credential, payload).await
    }

    /// Streaming generation in SSE framing. Only the response head is awaited;
    /// the body is consumed by the stream transcoder.
    pub async fn stream_generate_content(
        &self,
        credential: &Credential,
        model: &str,
        payload: &GenerateContentRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}?alt=sse", self.model_url(model, "streamGenerateContent"));
        tracing::debug!("POST {} with credential {}", url, credential);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(credential.expose())
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        Ok(response)
    }

    pub async fn embed_content(
        &self,
        credential: &Credential,
        model: &str,
        text: &str,
    ) -> Result<Bytes, UpstreamError> {
        let url = self.model_url(model, "embedContent");
        let payload = EmbedContentRequest {
            model: format!("models/{}", model),
            content: GeminiContent::text(None, text),
        };
        self.post_json(&url, credential, &payload).await
    }

    pub async fn batch_embed_contents(
        &self,
        credential: &Credential,
        model: &str,
        texts: &[String],
    ) -> Result<Bytes, UpstreamError> {
        let url = self.model_url(model, "batchEmbedContents");
        let payload = BatchEmbedContentsRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: format!("models/{}", model),
                    content: GeminiContent::text(None, text.as_str()),
                })
                .collect(),
        };
        self.post_json(&url, credential, &payload).await
    }
}
