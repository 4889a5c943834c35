use crate::codec::{decode_tool_calls, Capabilities, ChatCompletionChunk};
use crate::config::ProviderSettings;
use crate::error::StreamError;
use crate::model::{Conversation, ModelConfig, ModelId, ToolCall, ToolDefinition, Usage};
use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

pub mod mock;
pub mod openai;

pub use mock::{MockAdapter, MockEvent};
pub use openai::{OpenAiCompatibleAdapter, ProviderProfile};

/// Receiver of streamed text deltas. Spelled higher-ranked so it survives
/// the lifetimes `async_trait` names on trait methods.
pub type ChunkSink<'a> = dyn for<'s> FnMut(&'s str) + Send + 'a;

/// Everything an adapter needs for one request.
#[derive(Clone, Copy)]
pub struct StreamRequest<'a> {
    pub conversation: &'a Conversation,
    pub model: &'a ModelConfig,
    pub tools: Option<&'a [ToolDefinition]>,
    pub settings: &'a ProviderSettings,
}

impl<'a> StreamRequest<'a> {
    /// Tools to advertise, treating an empty list as no tools.
    pub fn tools(&self) -> Option<&'a [ToolDefinition]> {
        self.tools.filter(|tools| !tools.is_empty())
    }

    /// The conversation with the model's system prompt override applied.
    pub fn resolved_conversation(&self) -> Cow<'a, Conversation> {
        match self.model.system_prompt_override() {
            Some(prompt) => {
                let mut conversation = self.conversation.clone();
                conversation.set_system_prompt(prompt);
                Cow::Owned(conversation)
            }
            None => Cow::Borrowed(self.conversation),
        }
    }
}

/// Final result of a successful stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Concatenated text deltas; `None` when the model sent no text.
    pub text: Option<String>,
    /// Reconstructed tool calls; `None` when there are none.
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// One streaming backend family.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider namespace used in composite model ids.
    fn key(&self) -> &str;

    fn capabilities(&self, model: &ModelConfig) -> Capabilities;

    /// Streams one response. `on_chunk` is called synchronously for every
    /// non-empty text delta, in arrival order. Dropping the returned future
    /// tears the request down.
    async fn stream_response(
        &self,
        request: StreamRequest<'_>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Completion, StreamError>;
}

/// Request-scoped log of provider chunks. Owned by a single in-flight
/// request and consumed when the stream ends.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    chunks: Vec<ChatCompletionChunk>,
    text: String,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs a chunk, then forwards its text delta if it has one.
    pub fn push(&mut self, chunk: ChatCompletionChunk, on_chunk: &mut ChunkSink<'_>) {
        if let Some(delta) = chunk.text_delta() {
            self.text.push_str(delta);
            on_chunk(delta);
        }
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn finish(self, known_tools: Option<&[ToolDefinition]>) -> Completion {
        let tool_calls = decode_tool_calls(&self.chunks, known_tools);
        let usage = self
            .chunks
            .iter()
            .rev()
            .find_map(|chunk| chunk.usage.as_ref())
            .map(|usage| Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        let finish_reason = self
            .chunks
            .iter()
            .rev()
            .find_map(|chunk| chunk.finish_reason())
            .map(str::to_owned);
        Completion {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            usage,
            finish_reason,
        }
    }
}

/// Maps provider keys to adapters.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in OpenAI-compatible profile.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for profile in ProviderProfile::builtin() {
            registry.register(Arc::new(OpenAiCompatibleAdapter::new(profile)));
        }
        registry
    }

    /// Registers an adapter, replacing any previous one with the same key.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.key().to_string(), adapter);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Picks the adapter for a model by the provider prefix of its id.
    pub fn resolve(&self, model: &ModelConfig) -> Result<Arc<dyn ProviderAdapter>, StreamError> {
        let id = ModelId::parse(&model.id)?;
        self.get(id.provider())
            .ok_or_else(|| StreamError::UnknownProvider(id.provider().to_string()))
    }
}
