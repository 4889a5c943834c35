//! Streaming chat completions against several OpenAI-compatible providers.

pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod stream;
pub mod telemetry;

pub use config::{ConfigError, FileSettings, ProviderSettings, SettingsSource, StaticSettings};
pub use error::StreamError;
pub use model::{
    Attachment, ChatMessage, Conversation, ConversationError, MessageRole, ModelConfig, ModelId,
    ReasoningEffort, ToolCall, ToolDefinition, Usage,
};
pub use orchestrator::{
    ChatSession, FanOut, Orchestrator, StreamEvent, StreamEventKind, StreamHandle,
};
pub use provider::{
    ChunkSink, Completion, MockAdapter, MockEvent, OpenAiCompatibleAdapter, ProviderAdapter,
    ProviderProfile, ProviderRegistry, StreamRequest,
};
pub use stream::{
    stream_response, CancelSwitch, ChatTurn, StreamCallbacks, StreamOptions, StreamOutcome,
    StreamStatus,
};
