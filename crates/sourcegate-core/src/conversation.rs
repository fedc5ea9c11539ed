//! Role-tagged message history exchanged with the decision engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A request from the decision engine to run one tool.
///
/// `arguments` is kept as the raw JSON text the engine produced; parsing is the
/// dispatcher's job and must tolerate garbage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// What the decision engine answered for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Final(String),
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}

impl Decision {
    /// An empty tool-call list is a final answer.
    pub fn from_parts(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        if calls.is_empty() {
            Decision::Final(text.unwrap_or_default())
        } else {
            Decision::ToolCalls { text, calls }
        }
    }
}

/// Append-only history for one run. Tool-call ids stay unique.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    call_ids: BTreeSet<String>,
    synthesized: usize,
}

impl Conversation {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(prompt)],
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.messages.push(Message::system(content));
    }

    pub fn push_assistant_text(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(Some(content.into()), Vec::new()));
    }

    /// Appends an assistant turn carrying tool calls and returns the calls as stored.
    ///
    /// Empty or repeated ids are replaced with fresh `call_<n>` ids, so callers
    /// must use the returned calls when answering them.
    pub fn push_tool_calls(&mut self, text: Option<String>, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        let mut stored = Vec::with_capacity(calls.len());
        for mut call in calls {
            let id = call.id.trim().to_string();
            if id.is_empty() || self.call_ids.contains(&id) {
                call.id = self.fresh_id();
            } else {
                call.id = id;
            }
            self.call_ids.insert(call.id.clone());
            stored.push(call);
        }
        self.messages
            .push(Message::assistant(text, stored.clone()));
        stored
    }

    pub fn push_tool_result(&mut self, tool_call_id: &str, content: impl Into<String>) {
        self.messages.push(Message::tool(tool_call_id, content));
    }

    /// Most recent non-empty assistant text, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .filter_map(|m| m.content.as_deref())
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    fn fresh_id(&mut self) -> String {
        loop {
            self.synthesized += 1;
            let id = format!("call_{}", self.synthesized);
            if !self.call_ids.contains(&id) {
                return id;
            }
        }
    }
}
