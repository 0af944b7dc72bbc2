//! The conversation context (§3 `Message`) shared by every agent.
//!
//! A message is a role plus an ordered list of content parts: a single assistant turn can
//! carry text, thinking, and one or more tool calls, and a tool-result turn carries one part
//! per dispatched call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// One element of a [`Message`]'s content (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Thinking { text: String },
    Image { url: String, mime_type: Option<String> },
    /// Emitted on an assistant turn; `tool_call_id` on a later `ToolResult` part refers back
    /// to `id` here.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        ContentPart::Thinking { text: text.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ContentPart::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentPart::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// A single turn in an agent's context (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::ToolResult,
            content: parts,
        }
    }

    /// Concatenate every `Text` part, ignoring thinking/tool parts. Used by the classifiers
    /// and by simple text-only callers.
    pub fn text_only(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall { id, name, arguments } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }
}

/// Append-only conversation history for a single agent (§3: "appended-only within an
/// agent's context; cleared only by explicit `clear_messages`").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    messages: Vec<Message>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text_only())
    }

    /// Word count of the last user message — a Pravritti/Vichara classifier signal.
    pub fn last_user_word_count(&self) -> usize {
        self.last_user_text()
            .map(|t| t.split_whitespace().count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_ordered() {
        let mut ctx = AgentContext::new();
        ctx.append(Message::user("hi"));
        ctx.append(Message::assistant(vec![ContentPart::text("hello back")]));
        assert_eq!(ctx.messages().len(), 2);
        assert_eq!(ctx.messages()[0].role, Role::User);
        assert_eq!(ctx.messages()[1].role, Role::Assistant);
    }

    #[test]
    fn clear_messages_empties_context() {
        let mut ctx = AgentContext::new();
        ctx.append(Message::user("hi"));
        ctx.clear_messages();
        assert!(ctx.messages().is_empty());
    }

    #[test]
    fn tool_calls_extracted_from_assistant_message() {
        let msg = Message::assistant(vec![
            ContentPart::text("let me check"),
            ContentPart::tool_call("tc-1", "calculator", serde_json::json!({"expression": "6*7"})),
        ]);
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tc-1");
        assert_eq!(calls[0].1, "calculator");
    }
}
