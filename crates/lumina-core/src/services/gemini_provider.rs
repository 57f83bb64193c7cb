use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{
    ChatProvider, Content, GenerateRequest, Part, ProviderError, ProviderResponse, ResponseChunk,
    ResponseStream, Tool,
};
use crate::models::{GroundingChunk, GroundingMetadata, Role, SearchEntryPoint, WebSource};

pub const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone, Default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Gemini `generateContent` / `streamGenerateContent` over HTTPS.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(GEMINI_API_URL)
            .trim_end_matches('/');
        format!("{base_url}/{model}:{method}")
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProviderError::Configuration("No API key configured".to_string()))
    }

    async fn post(
        &self,
        request: &GenerateRequest,
        method: &str,
        streaming: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key()?;
        let body = GeminiRequest::from_request(request);

        let mut builder = self
            .client
            .post(self.endpoint(&request.model, method))
            .header("x-goog-api-key", api_key)
            .json(&body);
        if streaming {
            builder = builder
                .query(&[("alt", "sse")])
                .header("Accept", "text/event-stream");
        }

        debug!(model = %request.model, method, turns = body.contents.len(), "Calling Gemini");
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: api_error_message(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.post(&request, "generateContent", false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let (text, grounding_metadata) = parsed.into_parts();
        Ok(ProviderResponse {
            text,
            grounding_metadata,
        })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<ResponseStream, ProviderError> {
        let response = self
            .post(&request, "streamGenerateContent", true)
            .await?;
        let mut bytes = response.bytes_stream();

        let stream = try_stream! {
            let mut buffer = SseBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| ProviderError::Network(e.to_string()))?;
                for data in buffer.push(&chunk) {
                    if let Some(chunk) = parse_sse_data(&data)? {
                        yield chunk;
                    }
                }
            }
            if let Some(data) = buffer.finish() {
                if let Some(chunk) = parse_sse_data(&data)? {
                    yield chunk;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Accumulates raw bytes and yields complete `data:` payloads.
/// Network chunks can split an event anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data.to_string())
    }
}

fn parse_sse_data(data: &str) -> Result<Option<ResponseChunk>, ProviderError> {
    let parsed: GeminiResponse =
        serde_json::from_str(data).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let (text, grounding_metadata) = parsed.into_parts();
    if text.is_empty() && grounding_metadata.is_none() {
        return Ok(None);
    }
    Ok(Some(ResponseChunk {
        text,
        grounding_metadata,
    }))
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<GeminiErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

// Wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

impl GeminiRequest {
    fn from_request(request: &GenerateRequest) -> Self {
        let mut contents = request.history.clone();
        contents.push(Content {
            role: Role::User,
            parts: request.message.clone(),
        });

        Self {
            contents,
            system_instruction: request
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| SystemInstruction {
                    parts: vec![Part::text(s.clone())],
                }),
            tools: request
                .tools
                .iter()
                .map(|tool| match tool {
                    Tool::WebSearch => GeminiTool {
                        google_search: GoogleSearch {},
                    },
                })
                .collect(),
            generation_config: request.generation_config.map(|c| GeminiGenerationConfig {
                temperature: c.temperature,
                max_output_tokens: c.max_output_tokens,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

impl GeminiResponse {
    fn into_parts(self) -> (String, Option<GroundingMetadata>) {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return (String::new(), None);
        };
        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        let metadata = candidate
            .grounding_metadata
            .map(RawGroundingMetadata::normalize)
            .filter(|m| !m.is_empty());
        (text, metadata)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    grounding_metadata: Option<RawGroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<RawGroundingChunk>,
    search_entry_point: Option<RawSearchEntryPoint>,
}

#[derive(Debug, Deserialize)]
struct RawGroundingChunk {
    web: Option<RawWeb>,
}

#[derive(Debug, Deserialize)]
struct RawWeb {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSearchEntryPoint {
    rendered_content: Option<String>,
}

impl RawGroundingMetadata {
    fn normalize(self) -> GroundingMetadata {
        GroundingMetadata {
            grounding_chunks: self
                .grounding_chunks
                .into_iter()
                .map(|chunk| GroundingChunk {
                    web: chunk.web.map(|web| WebSource {
                        uri: web.uri.unwrap_or_default(),
                        title: web.title.unwrap_or_default(),
                    }),
                })
                .collect(),
            search_entry_point: self
                .search_entry_point
                .and_then(|e| e.rendered_content)
                .map(|rendered_content| SearchEntryPoint { rendered_content }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}
