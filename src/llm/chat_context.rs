//! Conversation history shared between the agent and the LLM.

use serde::{Deserialize, Serialize};

use super::function_context::{CalledFunction, FunctionCallInfo};
use crate::types::short_id;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// The human participant.
    User,
    /// The agent.
    Assistant,
    /// A tool-call result.
    Tool,
}

/// One message in the conversation. Immutable once appended to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique id within a context.
    pub id: String,
    /// Message author.
    pub role: ChatRole,
    /// Text content. `None` for pure tool-call carriers.
    pub content: Option<String>,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCallInfo>,
    /// For `Tool` messages, the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `Tool` messages, the function name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a plain text message.
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: short_id("msg"),
            role,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message carrying tool calls, optionally with the
    /// text that was spoken alongside them.
    pub fn with_tool_calls(calls: Vec<FunctionCallInfo>, text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self {
            id: short_id("msg"),
            role: ChatRole::Assistant,
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a tool-result message from an executed function.
    pub fn from_called_function(called: &CalledFunction) -> Self {
        let content = match (&called.result, &called.error) {
            (Some(value), _) => value.to_string(),
            (None, Some(error)) => format!("error: {error}"),
            (None, None) => String::new(),
        };
        Self {
            id: short_id("msg"),
            role: ChatRole::Tool,
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(called.call_info.tool_call_id.clone()),
            name: Some(called.call_info.name.clone()),
        }
    }

    /// Text content, or empty when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Ordered conversation history.
///
/// Message ids are unique within a context; tool results reference a prior
/// assistant message's call id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    /// Messages in conversation order.
    pub messages: Vec<ChatMessage>,
}

impl ChatContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context seeded with a system prompt.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.append(ChatMessage::new(ChatRole::System, prompt));
        ctx
    }

    /// Append a message.
    pub fn append(&mut self, message: ChatMessage) -> &mut Self {
        self.messages.push(message);
        self
    }

    /// Deep copy of this context.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Replace the last message, if any.
    pub fn replace_last(&mut self, message: ChatMessage) {
        if let Some(last) = self.messages.last_mut() {
            *last = message;
        } else {
            self.messages.push(message);
        }
    }

    /// Last message, if any.
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
