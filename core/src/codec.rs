//! Translation between the internal conversation model and the
//! OpenAI-compatible chat-completions wire schema.
//!
//! Encoding is pure: a conversation maps to exactly one wire message per
//! internal message, in order. Decoding works on the request-scoped chunk log,
//! which is only inspected once the stream has ended.

use crate::model::{Attachment, ChatMessage, Conversation, MessageRole, ToolCall, ToolDefinition};
use memchr::memchr;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content types a request path can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub image_support: bool,
    pub function_support: bool,
}

impl Capabilities {
    pub const TEXT_ONLY: Self = Self {
        image_support: false,
        function_support: false,
    };

    pub const FULL: Self = Self {
        image_support: true,
        function_support: true,
    };
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireMessage {
    pub role: MessageRole,
    pub content: WireContent,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Encodes the conversation for a request path with the given capabilities.
///
/// Images are sent as `image_url` parts on user messages when the path
/// supports images. Otherwise, and on every non-user message, each image is
/// replaced by a short text note so the request still goes through.
pub fn encode_conversation(
    conversation: &Conversation,
    capabilities: Capabilities,
) -> Vec<WireMessage> {
    conversation
        .messages()
        .iter()
        .map(|message| encode_message(message, capabilities))
        .collect()
}

fn encode_message(message: &ChatMessage, capabilities: Capabilities) -> WireMessage {
    if message.attachments.is_empty() {
        return WireMessage {
            role: message.role,
            content: WireContent::Text(message.content.clone()),
        };
    }

    if capabilities.image_support && message.role == MessageRole::User {
        let mut parts = Vec::with_capacity(message.attachments.len() + 1);
        if !message.content.is_empty() {
            parts.push(ContentPart::Text {
                text: message.content.clone(),
            });
        }
        for attachment in &message.attachments {
            match attachment {
                Attachment::Image { mime_type, data } => parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{mime_type};base64,{data}"),
                    },
                }),
            }
        }
        return WireMessage {
            role: message.role,
            content: WireContent::Parts(parts),
        };
    }

    let mut text = message.content.clone();
    for attachment in &message.attachments {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&omitted_attachment_note(attachment));
    }
    WireMessage {
        role: message.role,
        content: WireContent::Text(text),
    }
}

fn omitted_attachment_note(attachment: &Attachment) -> String {
    match attachment {
        Attachment::Image { mime_type, .. } => format!("[image attachment omitted: {mime_type}]"),
    }
}

/// Encodes tool definitions. An empty list yields `None` so the request omits
/// the `tools` field entirely.
pub fn encode_tools(tools: &[ToolDefinition]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

impl ChatCompletionChunk {
    /// The non-empty text delta carried by the first choice.
    pub fn text_delta(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .filter(|content| !content.is_empty())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .iter()
            .find_map(|choice| choice.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    index: Option<u32>,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl PendingToolCall {
    fn accepts(&self, delta: &ToolCallDelta) -> bool {
        if let (Some(existing), Some(incoming)) = (&self.id, &delta.id) {
            if existing != incoming {
                return false;
            }
        }
        match delta.index {
            Some(index) => self.index == Some(index),
            None => delta.id.is_some() && self.id == delta.id,
        }
    }

    fn apply(&mut self, delta: &ToolCallDelta) {
        if self.index.is_none() {
            self.index = delta.index;
        }
        if self.id.is_none() {
            self.id = delta.id.clone().filter(|id| !id.is_empty());
        }
        if let Some(function) = &delta.function {
            if self.name.is_none() {
                self.name = function.name.clone().filter(|name| !name.is_empty());
            }
            if let Some(arguments) = &function.arguments {
                self.arguments.push_str(arguments);
            }
        }
    }

    fn close(self, position: usize) -> Option<ToolCall> {
        let name = self.name?;
        let trimmed = self.arguments.trim();
        let arguments = if trimmed.is_empty() {
            "{}".to_string()
        } else if serde_json::from_str::<Value>(trimmed).is_ok() {
            trimmed.to_string()
        } else {
            tracing::debug!(tool = %name, "dropping tool call with incomplete arguments");
            return None;
        };
        let id = self
            .id
            .unwrap_or_else(|| format!("call_{}", self.index.unwrap_or(position as u32)));
        Some(ToolCall {
            id,
            name,
            arguments,
        })
    }
}

/// Reassembles tool calls from a complete chunk log.
///
/// Fragments are grouped by their `index` (or `id` when a provider omits the
/// index, or the most recent call when both are missing). A continuation
/// joins the newest matching call, since some providers reuse one index for
/// consecutive calls. Calls without a
/// name, with arguments that are not valid JSON, or naming a tool outside
/// `known_tools` are dropped.
pub fn decode_tool_calls(
    chunks: &[ChatCompletionChunk],
    known_tools: Option<&[ToolDefinition]>,
) -> Vec<ToolCall> {
    let mut pending: Vec<PendingToolCall> = Vec::new();

    let deltas = chunks
        .iter()
        .flat_map(|chunk| chunk.choices.iter())
        .filter_map(|choice| choice.delta.tool_calls.as_ref())
        .flatten();

    for delta in deltas {
        let target = match pending.iter().rposition(|call| call.accepts(delta)) {
            Some(position) => position,
            None if delta.index.is_none() && delta.id.is_none() && !pending.is_empty() => {
                pending.len() - 1
            }
            None => {
                pending.push(PendingToolCall::default());
                pending.len() - 1
            }
        };
        pending[target].apply(delta);
    }

    pending
        .into_iter()
        .enumerate()
        .filter_map(|(position, call)| call.close(position))
        .filter(|call| match known_tools {
            Some(tools) => {
                let known = tools.iter().any(|tool| tool.name == call.name);
                if !known {
                    tracing::debug!(tool = %call.name, "dropping call to unknown tool");
                }
                known
            }
            None => true,
        })
        .collect()
}

/// One classified server-sent-events line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseEvent<'a> {
    Data(&'a str),
    Done,
    Ignored,
}

pub fn parse_sse_line(line: &str) -> SseEvent<'_> {
    let line = line.trim();
    match line.strip_prefix("data:").map(str::trim_start) {
        Some("[DONE]") => SseEvent::Done,
        Some(payload) if !payload.is_empty() => SseEvent::Data(payload),
        _ => SseEvent::Ignored,
    }
}

/// Result of decoding one SSE data payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkDecode {
    Chunk(ChatCompletionChunk),
    /// The provider reported an error inside the stream.
    ProviderError(String),
    /// The payload could not be understood; safe to skip.
    Malformed(String),
}

pub fn decode_chunk(payload: &str) -> ChunkDecode {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => return ChunkDecode::Malformed(err.to_string()),
    };
    if value.get("error").is_some_and(|error| !error.is_null()) {
        return ChunkDecode::ProviderError(describe_api_error(payload));
    }
    match serde_json::from_value(value) {
        Ok(chunk) => ChunkDecode::Chunk(chunk),
        Err(err) => ChunkDecode::Malformed(err.to_string()),
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

/// Human readable summary of a provider error body.
pub fn describe_api_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "the provider returned an empty error response".to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            return summary;
        }
    }
    trimmed.to_string()
}

/// Splits a byte stream into lines without assuming chunk boundaries line up
/// with line or UTF-8 boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Takes the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        let newline_pos = memchr(b'\n', &self.buffer)?;
        let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
        Some(decode_line(&line[..newline_pos]))
    }

    /// Takes whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(decode_line(&line))
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, std::str::Utf8Error> {
    std::str::from_utf8(bytes).map(|line| line.trim_end_matches('\r').to_string())
}
