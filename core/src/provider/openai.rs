use super::{ChunkSink, Completion, ProviderAdapter, ResponseAccumulator, StreamRequest};
use crate::codec::{
    decode_chunk, describe_api_error, encode_conversation, encode_tools, parse_sse_line,
    Capabilities, ChunkDecode, LineBuffer, SseEvent, WireMessage, WireTool,
};
use crate::config::{ConfigError, ProviderSettings};
use crate::error::StreamError;
use crate::model::ModelConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Static description of one OpenAI-compatible backend.
///
/// Image degrade policy: profiles without `image_support` replace every image
/// attachment with a `[image attachment omitted: <mime>]` note in the message
/// text. Profiles without `function_support` never send tool definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub key: String,
    /// Fixed endpoint; `None` means the endpoint comes from
    /// `ProviderSettings::custom_base_url`.
    pub base_url: Option<String>,
    pub requires_api_key: bool,
    pub image_support: bool,
    pub function_support: bool,
}

impl ProviderProfile {
    pub fn hosted(
        key: impl Into<String>,
        base_url: impl Into<String>,
        image_support: bool,
    ) -> Self {
        Self {
            key: key.into(),
            base_url: Some(base_url.into()),
            requires_api_key: true,
            image_support,
            function_support: true,
        }
    }

    /// A user-supplied endpoint such as a local inference server.
    pub fn custom() -> Self {
        Self {
            key: "custom".to_string(),
            base_url: None,
            requires_api_key: false,
            image_support: false,
            function_support: true,
        }
    }

    pub fn builtin() -> Vec<Self> {
        vec![
            Self::hosted("openai", "https://api.openai.com/v1", true),
            Self::hosted("openrouter", "https://openrouter.ai/api/v1", true),
            Self::hosted("groq", "https://api.groq.com/openai/v1", false),
            Self::hosted("together", "https://api.together.xyz/v1", false),
            Self::hosted("mistral", "https://api.mistral.ai/v1", false),
            Self::hosted("deepseek", "https://api.deepseek.com/v1", false),
            Self::custom(),
        ]
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Streams chat completions from any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleAdapter {
    client: Client,
    profile: ProviderProfile,
}

impl OpenAiCompatibleAdapter {
    pub fn new(profile: ProviderProfile) -> Self {
        Self::with_client(Client::new(), profile)
    }

    pub fn with_client(client: Client, profile: ProviderProfile) -> Self {
        Self { client, profile }
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn resolve_base_url<'s>(
        &'s self,
        settings: &'s ProviderSettings,
    ) -> Result<&'s str, ConfigError> {
        self.profile
            .base_url
            .as_deref()
            .or_else(|| settings.custom_base_url())
            .ok_or_else(|| ConfigError::MissingBaseUrl(self.profile.key.clone()))
    }

    fn resolve_api_key<'s>(
        &self,
        settings: &'s ProviderSettings,
    ) -> Result<Option<&'s str>, ConfigError> {
        match settings.api_key(&self.profile.key) {
            Some(key) => Ok(Some(key)),
            None if self.profile.requires_api_key => {
                Err(ConfigError::MissingApiKey(self.profile.key.clone()))
            }
            None => Ok(None),
        }
    }

    /// Handles one SSE line. Returns `true` once the stream is finished.
    fn handle_line(
        &self,
        line: &str,
        accumulator: &mut ResponseAccumulator,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<bool, StreamError> {
        match parse_sse_line(line) {
            SseEvent::Done => Ok(true),
            SseEvent::Ignored => Ok(false),
            SseEvent::Data(payload) => match decode_chunk(payload) {
                ChunkDecode::Chunk(chunk) => {
                    accumulator.push(chunk, on_chunk);
                    Ok(false)
                }
                ChunkDecode::ProviderError(message) => Err(StreamError::Transport(message)),
                ChunkDecode::Malformed(reason) => {
                    warn!(provider = %self.profile.key, %reason, "skipping malformed stream chunk");
                    Ok(false)
                }
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn key(&self) -> &str {
        &self.profile.key
    }

    fn capabilities(&self, _model: &ModelConfig) -> Capabilities {
        Capabilities {
            image_support: self.profile.image_support,
            function_support: self.profile.function_support,
        }
    }

    async fn stream_response(
        &self,
        request: StreamRequest<'_>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Completion, StreamError> {
        let base_url = self.resolve_base_url(request.settings)?;
        let api_key = self.resolve_api_key(request.settings)?;
        let model_id = request.model.model_id()?;

        let capabilities = self.capabilities(request.model);
        let conversation = request.resolved_conversation();
        let tools = request.tools().filter(|_| capabilities.function_support);
        let body = ChatRequest {
            model: model_id.model(),
            messages: encode_conversation(&conversation, capabilities),
            stream: true,
            tools: tools.and_then(encode_tools),
            max_tokens: request.model.max_tokens,
            temperature: request.model.temperature,
            reasoning_effort: request.model.reasoning_effort.map(|effort| effort.as_str()),
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let url = endpoint_url(base_url, "chat/completions");
        info!(
            provider = %self.profile.key,
            model = %model_id.model(),
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "opening chat stream"
        );

        let mut http_request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream");
        if let Some(key) = api_key {
            http_request = http_request.bearer_auth(key);
        }
        let response = http_request.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                message: describe_api_error(&error_text),
            });
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut accumulator = ResponseAccumulator::new();
        let mut finished = false;

        'stream: while let Some(bytes) = stream.next().await {
            lines.extend(&bytes?);
            while let Some(line) = lines.next_line() {
                match line {
                    Ok(line) => {
                        if self.handle_line(&line, &mut accumulator, on_chunk)? {
                            finished = true;
                            break 'stream;
                        }
                    }
                    Err(err) => return Err(invalid_utf8(&self.profile.key, err)),
                }
            }
        }
        if !finished {
            match lines.finish() {
                Some(Ok(line)) => {
                    self.handle_line(&line, &mut accumulator, on_chunk)?;
                }
                Some(Err(err)) => return Err(invalid_utf8(&self.profile.key, err)),
                None => {}
            }
        }

        debug!(
            provider = %self.profile.key,
            chunks = accumulator.len(),
            "chat stream finished"
        );
        Ok(accumulator.finish(tools))
    }
}

fn invalid_utf8(provider: &str, err: std::str::Utf8Error) -> StreamError {
    warn!(%provider, %err, "invalid UTF-8 in stream");
    StreamError::Transport(format!("stream was not valid UTF-8: {err}"))
}

fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}
