use crate::config::ConfigError;
use crate::model::InvalidModelId;
use std::time::Duration;

/// Request-level failures of a streaming call.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    InvalidModelId(#[from] InvalidModelId),
    #[error("no provider registered for `{0}`")]
    UnknownProvider(String),
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("stream task failed: {0}")]
    Task(String),
}

impl StreamError {
    /// Message suitable for display next to the failed reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(err) => err.user_message(),
            Self::InvalidModelId(err) => err.to_string(),
            Self::UnknownProvider(key) => {
                format!("Provider `{key}` is not available. Pick another model in Settings.")
            }
            Self::Http { message, .. } if !message.is_empty() => message.clone(),
            Self::Http { status, .. } => {
                format!("The provider rejected the request (HTTP {status}).")
            }
            Self::Transport(message) if !message.is_empty() => message.clone(),
            Self::Transport(_) => "The connection to the provider failed.".to_string(),
            Self::Timeout(_) | Self::Task(_) => self.to_string(),
        }
    }

    /// Configuration problems are never worth retrying automatically.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidModelId(_) | Self::UnknownProvider(_)
        )
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
