use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Separator between the provider namespace and the model name in a
/// composite model id such as `openai::gpt-4o`.
pub const MODEL_ID_SEPARATOR: &str = "::";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    /// Base64 encoded image data.
    Image { mime_type: String, data: String },
}

impl Attachment {
    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    /// Composite id of the model that produced an assistant reply.
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            model: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("a system message must be the first and only system message in a conversation")]
    MisplacedSystemMessage,
    #[error("expected a user message, got {0:?}")]
    UnexpectedRole(MessageRole),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: "New chat".to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Builds a conversation from already ordered messages, checking the
    /// system message invariant.
    pub fn from_messages(
        messages: impl IntoIterator<Item = ChatMessage>,
    ) -> Result<Self, ConversationError> {
        let mut conversation = Self::new();
        for message in messages {
            conversation.add_message(message)?;
        }
        Ok(conversation)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Appends a message. Returns whether the title changed.
    pub fn add_message(&mut self, message: ChatMessage) -> Result<bool, ConversationError> {
        if message.role == MessageRole::System && !self.messages.is_empty() {
            return Err(ConversationError::MisplacedSystemMessage);
        }
        let mut title_changed = false;
        if message.role == MessageRole::User
            && !self.messages.iter().any(|m| m.role == MessageRole::User)
        {
            self.title = snippet(&message.content);
            title_changed = true;
        }
        self.messages.push(message);
        self.updated_at = Utc::now();
        Ok(title_changed)
    }

    /// Replaces the leading system message, or inserts one.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let message = ChatMessage::system(prompt);
        match self.messages.first() {
            Some(first) if first.role == MessageRole::System => self.messages[0] = message,
            _ => self.messages.insert(0, message),
        }
        self.updated_at = Utc::now();
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
    }

    /// Messages after the leading system message, if any.
    pub fn turns(&self) -> &[ChatMessage] {
        match self.messages.first() {
            Some(first) if first.role == MessageRole::System => &self.messages[1..],
            _ => &self.messages,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid model id `{0}`: expected `provider::model`")]
pub struct InvalidModelId(pub String);

/// A parsed `provider::model` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId {
    provider: String,
    model: String,
}

impl ModelId {
    pub fn parse(composite: &str) -> Result<Self, InvalidModelId> {
        let (provider, model) = composite
            .split_once(MODEL_ID_SEPARATOR)
            .ok_or_else(|| InvalidModelId(composite.to_string()))?;
        if provider.trim().is_empty() || model.trim().is_empty() {
            return Err(InvalidModelId(composite.to_string()));
        }
        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// The model name as sent on the wire.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.provider, MODEL_ID_SEPARATOR, self.model)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Composite `provider::model` id.
    pub id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "ModelConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(default)]
    pub is_deprecated: bool,
}

impl ModelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: None,
            reasoning_effort: None,
            max_tokens: None,
            temperature: None,
            enabled: true,
            is_default: false,
            is_internal: false,
            is_deprecated: false,
        }
    }

    fn default_enabled() -> bool {
        true
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model_id(&self) -> Result<ModelId, InvalidModelId> {
        ModelId::parse(&self.id)
    }

    /// The configured system prompt override. Blank strings count as unset.
    pub fn system_prompt_override(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema describing the tool parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation reconstructed from a completed stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text, fully concatenated.
    pub arguments: String,
}

impl ToolCall {
    pub fn parsed_arguments(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

fn snippet(content: &str) -> String {
    let trimmed = content.trim();
    const MAX: usize = 42;
    let mut chars = trimmed.chars();
    let mut acc = String::new();
    for _ in 0..MAX {
        if let Some(ch) = chars.next() {
            acc.push(ch);
        } else {
            return trimmed.to_string();
        }
    }
    acc.push('…');
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_model_id() {
        let id = ModelId::parse("openai::gpt-4o").expect("valid id");
        assert_eq!(id.provider(), "openai");
        assert_eq!(id.model(), "gpt-4o");
        assert_eq!(id.to_string(), "openai::gpt-4o");
    }

    #[test]
    fn splits_on_first_separator_only() {
        let id = ModelId::parse("openrouter::meta::llama-3").expect("valid id");
        assert_eq!(id.provider(), "openrouter");
        assert_eq!(id.model(), "meta::llama-3");
    }

    #[test]
    fn rejects_ids_without_separator() {
        assert_eq!(
            ModelId::parse("gpt-4o"),
            Err(InvalidModelId("gpt-4o".to_string()))
        );
        assert!(ModelId::parse("::gpt-4o").is_err());
        assert!(ModelId::parse("openai::").is_err());
    }

    #[test]
    fn system_message_must_come_first() {
        let mut conversation = Conversation::new();
        conversation
            .add_message(ChatMessage::system("be brief"))
            .expect("leading system message");
        conversation
            .add_message(ChatMessage::user("hi"))
            .expect("user message");
        let err = conversation
            .add_message(ChatMessage::system("again"))
            .unwrap_err();
        assert_eq!(err, ConversationError::MisplacedSystemMessage);
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn set_system_prompt_replaces_leading_message() {
        let mut conversation =
            Conversation::from_messages([ChatMessage::user("hello")]).expect("conversation");
        conversation.set_system_prompt("first");
        conversation.set_system_prompt("second");
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.system_prompt(), Some("second"));
        assert_eq!(conversation.turns().len(), 1);
    }

    #[test]
    fn title_tracks_first_user_message() {
        let mut conversation = Conversation::new();
        let changed = conversation
            .add_message(ChatMessage::user("What is the capital of France?"))
            .expect("add");
        assert!(changed);
        assert_eq!(conversation.title, "What is the capital of France?");
        let changed = conversation
            .add_message(ChatMessage::user("And of Spain?"))
            .expect("add");
        assert!(!changed);
    }

    #[test]
    fn blank_system_prompt_override_is_ignored() {
        let config = ModelConfig::new("openai::gpt-4o").with_system_prompt("   ");
        assert_eq!(config.system_prompt_override(), None);
        let config = ModelConfig::new("openai::gpt-4o").with_system_prompt("Be terse.");
        assert_eq!(config.system_prompt_override(), Some("Be terse."));
    }
}
