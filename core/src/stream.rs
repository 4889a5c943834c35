//! Drives one provider request and reports its result exactly once.
//!
//! [`stream_outcome`] returns an explicit [`StreamOutcome`]. [`stream_response`]
//! binds that outcome to caller callbacks: success goes to `on_complete`,
//! failure goes to `on_error` when one is supplied and is returned as an
//! error otherwise. Once [`CancelSwitch::cancel`] returns, no callback starts.

use crate::config::SettingsSource;
use crate::error::StreamError;
use crate::model::{Conversation, ModelConfig, ToolDefinition};
use crate::provider::{ChunkSink, Completion, ProviderAdapter, StreamRequest};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::ReentrantMutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

/// Inputs of one request, owned so the request can run on its own task.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub conversation: Conversation,
    pub model: ModelConfig,
    pub tools: Vec<ToolDefinition>,
}

impl ChatTurn {
    pub fn new(conversation: Conversation, model: ModelConfig) -> Self {
        Self {
            conversation,
            model,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Cancels one request.
///
/// Callbacks run while holding the switch's gate and `cancel` takes the same
/// gate, so cancelling waits for a callback already in progress and no
/// callback starts afterwards. The gate is reentrant: a callback may cancel
/// its own request.
#[derive(Clone)]
pub struct CancelSwitch {
    token: CancellationToken,
    gate: Arc<ReentrantMutex<()>>,
}

impl CancelSwitch {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: Arc::new(ReentrantMutex::new(())),
        }
    }

    pub fn cancel(&self) {
        let _gate = self.gate.lock();
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Runs `f` under the gate unless the request is already cancelled.
    pub fn run_unless_cancelled<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            None
        } else {
            Some(f())
        }
    }
}

impl Default for CancelSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSwitch")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Overrides the timeout from the provider settings.
    pub timeout: Option<Duration>,
    pub cancel: CancelSwitch,
}

impl StreamOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSwitch) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug)]
pub enum StreamOutcome {
    Success(Completion),
    Failure(StreamError),
    Cancelled,
}

/// How a callback-bound request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    /// The failure was handed to `on_error`.
    Failed,
    Cancelled,
}

pub type ChunkCallback = Box<dyn FnMut(&str) + Send>;
pub type CompleteCallback = Box<dyn FnOnce(Completion) -> BoxFuture<'static, ()> + Send>;
pub type ErrorCallback = Box<dyn FnOnce(String) + Send>;

pub struct StreamCallbacks {
    on_chunk: ChunkCallback,
    on_complete: CompleteCallback,
    on_error: Option<ErrorCallback>,
}

impl StreamCallbacks {
    pub fn new<C, F>(on_chunk: C, on_complete: F) -> Self
    where
        C: FnMut(&str) + Send + 'static,
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            on_chunk: Box::new(on_chunk),
            on_complete: Box::new(move |completion: Completion| {
                on_complete(completion);
                futures::future::ready(()).boxed()
            }),
            on_error: None,
        }
    }

    /// Like [`StreamCallbacks::new`], for completion handlers that need to
    /// await (for example to persist the reply).
    pub fn with_async_complete<C, F, Fut>(on_chunk: C, on_complete: F) -> Self
    where
        C: FnMut(&str) + Send + 'static,
        F: FnOnce(Completion) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on_chunk: Box::new(on_chunk),
            on_complete: Box::new(move |completion: Completion| on_complete(completion).boxed()),
            on_error: None,
        }
    }

    pub fn on_error(mut self, on_error: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

/// Runs one request and returns its outcome. `on_chunk` is never called
/// once `options.cancel` has fired.
pub async fn stream_outcome(
    adapter: &dyn ProviderAdapter,
    settings: &dyn SettingsSource,
    turn: &ChatTurn,
    on_chunk: &mut ChunkSink<'_>,
    options: &StreamOptions,
) -> StreamOutcome {
    let cancel = &options.cancel;
    if cancel.is_cancelled() {
        return StreamOutcome::Cancelled;
    }

    let mut guarded = |delta: &str| {
        cancel.run_unless_cancelled(|| on_chunk(delta));
    };

    let work = async {
        let settings = settings.provider_settings().await?;
        let timeout = options.timeout.or(settings.request_timeout);
        let request = StreamRequest {
            conversation: &turn.conversation,
            model: &turn.model,
            tools: Some(&turn.tools),
            settings: &settings,
        };
        let response = adapter.stream_response(request, &mut guarded);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, response)
                .await
                .map_err(|_| StreamError::Timeout(limit))?,
            None => response.await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => StreamOutcome::Cancelled,
        result = work => match result {
            Ok(completion) => StreamOutcome::Success(completion),
            Err(err) => StreamOutcome::Failure(err),
        },
    };

    match &outcome {
        StreamOutcome::Success(completion) => info!(
            model = %turn.model.id,
            chars = completion.text.as_ref().map_or(0, String::len),
            tool_calls = completion.tool_calls.as_ref().map_or(0, Vec::len),
            "stream completed"
        ),
        StreamOutcome::Failure(err) => warn!(model = %turn.model.id, %err, "stream failed"),
        StreamOutcome::Cancelled => info!(model = %turn.model.id, "stream cancelled"),
    }
    outcome
}

/// Hands an outcome to the callbacks. Exactly one of `on_complete`,
/// `on_error` or the returned error observes a finished request.
///
/// The terminal callback is entered under the cancel gate. An async
/// completion handler that has been entered runs to the end.
pub async fn deliver(
    outcome: StreamOutcome,
    callbacks: StreamCallbacks,
    cancel: &CancelSwitch,
) -> Result<StreamStatus, StreamError> {
    let StreamCallbacks {
        on_complete,
        on_error,
        ..
    } = callbacks;
    match outcome {
        StreamOutcome::Success(completion) => {
            match cancel.run_unless_cancelled(|| on_complete(completion)) {
                Some(pending) => {
                    pending.await;
                    Ok(StreamStatus::Completed)
                }
                None => Ok(StreamStatus::Cancelled),
            }
        }
        StreamOutcome::Failure(err) => match on_error {
            Some(on_error) => match cancel.run_unless_cancelled(|| on_error(err.user_message())) {
                Some(()) => Ok(StreamStatus::Failed),
                None => Ok(StreamStatus::Cancelled),
            },
            None if cancel.is_cancelled() => Ok(StreamStatus::Cancelled),
            None => Err(err),
        },
        StreamOutcome::Cancelled => Ok(StreamStatus::Cancelled),
    }
}

/// Streams a response through caller callbacks.
pub async fn stream_response(
    adapter: &dyn ProviderAdapter,
    settings: &dyn SettingsSource,
    turn: &ChatTurn,
    mut callbacks: StreamCallbacks,
    options: &StreamOptions,
) -> Result<StreamStatus, StreamError> {
    let outcome = stream_outcome(
        adapter,
        settings,
        turn,
        callbacks.on_chunk.as_mut(),
        options,
    )
    .await;
    deliver(outcome, callbacks, &options.cancel).await
}
