use super::{ChunkSink, Completion, ProviderAdapter, ResponseAccumulator, StreamRequest};
use crate::codec::{Capabilities, ChatCompletionChunk, ChunkChoice, ChunkDelta};
use crate::error::StreamError;
use crate::model::{MessageRole, ModelConfig};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// One step of a scripted mock response.
#[derive(Debug, Clone)]
pub enum MockEvent {
    Text(String),
    Chunk(ChatCompletionChunk),
    Delay(Duration),
    Fail(String),
}

impl MockEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Debug, Clone)]
enum MockScript {
    Events(Vec<MockEvent>),
    Echo,
}

/// Replays scripted chunks without touching the network.
#[derive(Debug)]
pub struct MockAdapter {
    key: String,
    script: MockScript,
    calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(key: impl Into<String>, events: Vec<MockEvent>) -> Self {
        Self {
            key: key.into(),
            script: MockScript::Events(events),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers every request by quoting the latest user message back.
    pub fn echo(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            script: MockScript::Echo,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of requests that got past validation.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn echo_events(&self, request: &StreamRequest<'_>, model: &str) -> Vec<MockEvent> {
        let prompt = request
            .conversation
            .messages()
            .iter()
            .rev()
            .find(|msg| msg.role == MessageRole::User)
            .map(|msg| msg.content.clone())
            .unwrap_or_else(|| "How can I help you today?".to_string());
        let reply = format!("[Mock] Model {model}: received '{prompt}'.");
        reply
            .split_inclusive(' ')
            .flat_map(|word| {
                [
                    MockEvent::Delay(Duration::from_millis(2)),
                    MockEvent::text(word),
                ]
            })
            .collect()
    }
}

fn text_chunk(text: String) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: None,
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: Some(text),
                ..ChunkDelta::default()
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn key(&self) -> &str {
        &self.key
    }

    fn capabilities(&self, _model: &ModelConfig) -> Capabilities {
        Capabilities::FULL
    }

    async fn stream_response(
        &self,
        request: StreamRequest<'_>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Completion, StreamError> {
        let model_id = request.model.model_id()?;
        self.calls.fetch_add(1, Ordering::SeqCst);

        let events = match &self.script {
            MockScript::Events(events) => events.clone(),
            MockScript::Echo => self.echo_events(&request, model_id.model()),
        };

        let mut accumulator = ResponseAccumulator::new();
        for event in events {
            match event {
                MockEvent::Text(text) => accumulator.push(text_chunk(text), on_chunk),
                MockEvent::Chunk(chunk) => accumulator.push(chunk, on_chunk),
                MockEvent::Delay(duration) => sleep(duration).await,
                MockEvent::Fail(message) => return Err(StreamError::Transport(message)),
            }
        }
        Ok(accumulator.finish(request.tools()))
    }
}
