use crate::config::SettingsSource;
use crate::error::StreamError;
use crate::model::{
    ChatMessage, Conversation, ConversationError, MessageRole, ModelConfig, ToolDefinition,
};
use crate::provider::{Completion, ProviderRegistry};
use crate::stream::{
    self, CancelSwitch, ChatTurn, StreamCallbacks, StreamOptions, StreamOutcome, StreamStatus,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// An in-flight request running on its own task.
pub struct StreamHandle {
    model: String,
    cancel: CancelSwitch,
    task: JoinHandle<Result<StreamStatus, StreamError>>,
}

impl StreamHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Aborts the request. Waits for a callback that is already running;
    /// no callback starts after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_switch(&self) -> CancelSwitch {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<StreamStatus, StreamError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(StreamError::Task(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Chunk(String),
    Completed(Completion),
    Failed(String),
}

/// A stream event tagged with the composite id of the model it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub model: String,
    pub kind: StreamEventKind,
}

/// Concurrent requests to several models and their merged event feed.
/// Events of one model keep their order; models interleave freely.
pub struct FanOut {
    pub handles: Vec<StreamHandle>,
    pub events: UnboundedReceiver<StreamEvent>,
}

impl FanOut {
    fn empty() -> Self {
        let (_, events) = mpsc::unbounded_channel();
        Self {
            handles: Vec::new(),
            events,
        }
    }

    pub fn cancel_all(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    pub async fn join_all(self) -> Vec<(String, Result<StreamStatus, StreamError>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let model = handle.model.clone();
            results.push((model, handle.join().await));
        }
        results
    }
}

/// Callbacks that forward everything to `tx`, tagged with `model`.
/// `on_reply` sees a successful completion before its event is sent.
fn event_callbacks(
    model: &str,
    tx: &UnboundedSender<StreamEvent>,
    on_reply: impl FnOnce(&Completion) + Send + 'static,
) -> StreamCallbacks {
    let (chunk_tx, complete_tx, error_tx) = (tx.clone(), tx.clone(), tx.clone());
    let (chunk_model, complete_model, error_model) =
        (model.to_string(), model.to_string(), model.to_string());
    StreamCallbacks::new(
        move |delta| {
            let _ = chunk_tx.send(StreamEvent {
                model: chunk_model.clone(),
                kind: StreamEventKind::Chunk(delta.to_string()),
            });
        },
        move |completion| {
            on_reply(&completion);
            let _ = complete_tx.send(StreamEvent {
                model: complete_model,
                kind: StreamEventKind::Completed(completion),
            });
        },
    )
    .on_error(move |message| {
        let _ = error_tx.send(StreamEvent {
            model: error_model,
            kind: StreamEventKind::Failed(message),
        });
    })
}

/// Entry point for running provider streams as independent tasks.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    settings: Arc<dyn SettingsSource>,
    timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            registry: Arc::new(registry),
            settings,
            timeout: None,
        }
    }

    /// Default per-request timeout, overriding the one from settings.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Starts one request. Unknown providers and malformed model ids are
    /// reported through the callbacks like any other failure.
    pub fn spawn_stream(&self, turn: ChatTurn, callbacks: StreamCallbacks) -> StreamHandle {
        let cancel = CancelSwitch::new();
        let options = StreamOptions {
            timeout: self.timeout,
            cancel: cancel.clone(),
        };
        let model = turn.model.id.clone();
        let registry = self.registry.clone();
        let settings = self.settings.clone();

        let task = tokio::spawn(async move {
            match registry.resolve(&turn.model) {
                Ok(adapter) => {
                    stream::stream_response(
                        adapter.as_ref(),
                        settings.as_ref(),
                        &turn,
                        callbacks,
                        &options,
                    )
                    .await
                }
                Err(err) => {
                    tracing::warn!(model = %turn.model.id, %err, "cannot route request");
                    stream::deliver(StreamOutcome::Failure(err), callbacks, &options.cancel).await
                }
            }
        });

        StreamHandle {
            model,
            cancel,
            task,
        }
    }

    /// Queries every model concurrently with the same conversation.
    pub fn fan_out(
        &self,
        conversation: &Conversation,
        models: &[ModelConfig],
        tools: &[ToolDefinition],
    ) -> FanOut {
        let (tx, events) = mpsc::unbounded_channel();
        let handles = models
            .iter()
            .map(|model| {
                let turn = ChatTurn::new(conversation.clone(), model.clone())
                    .with_tools(tools.to_vec());
                self.spawn_stream(turn, event_callbacks(&model.id, &tx, |_| {}))
            })
            .collect();
        FanOut { handles, events }
    }
}

/// A conversation answered by several models side by side.
///
/// Each successful reply is appended as an assistant message tagged with its
/// model. When a model is asked again it only sees its own earlier replies.
#[derive(Clone)]
pub struct ChatSession {
    id: Uuid,
    conversation: Arc<RwLock<Conversation>>,
    orchestrator: Orchestrator,
}

impl ChatSession {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self::with_conversation(orchestrator, Conversation::new())
    }

    pub fn with_conversation(orchestrator: Orchestrator, conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            conversation: Arc::new(RwLock::new(conversation)),
            orchestrator,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation(&self) -> Conversation {
        self.conversation.read().clone()
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.conversation.write().set_system_prompt(prompt);
    }

    /// Records the user message and asks every enabled model for a reply.
    pub fn send_user_message(
        &self,
        message: ChatMessage,
        models: &[ModelConfig],
        tools: &[ToolDefinition],
    ) -> Result<FanOut, ConversationError> {
        if message.content.trim().is_empty() && message.attachments.is_empty() {
            return Ok(FanOut::empty());
        }
        if message.role != MessageRole::User {
            return Err(ConversationError::UnexpectedRole(message.role));
        }
        self.conversation.write().add_message(message)?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for model in models.iter().filter(|model| model.enabled) {
            let history = self.history_for(&model.id)?;
            let turn = ChatTurn::new(history, model.clone()).with_tools(tools.to_vec());
            handles.push(
                self.orchestrator
                    .spawn_stream(turn, self.recording_callbacks(&model.id, &tx)),
            );
        }
        Ok(FanOut { handles, events })
    }

    fn recording_callbacks(
        &self,
        model: &str,
        tx: &UnboundedSender<StreamEvent>,
    ) -> StreamCallbacks {
        let conversation = self.conversation.clone();
        let owner = model.to_string();
        event_callbacks(model, tx, move |completion| {
            if let Some(text) = &completion.text {
                let reply = ChatMessage::assistant(text.clone()).with_model(owner);
                if let Err(err) = conversation.write().add_message(reply) {
                    tracing::error!(%err, "failed to record assistant reply");
                }
            }
        })
    }

    fn history_for(&self, model: &str) -> Result<Conversation, ConversationError> {
        let conversation = self.conversation.read();
        let messages = conversation
            .messages()
            .iter()
            .filter(|message| {
                message.role != MessageRole::Assistant
                    || message.model.as_deref().map_or(true, |owner| owner == model)
            })
            .cloned()
            .collect::<Vec<_>>();
        drop(conversation);
        Conversation::from_messages(messages)
    }
}
