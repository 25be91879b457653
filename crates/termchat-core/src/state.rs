//! UI-agnostic conversation types
//!
//! These are shared between the terminal viewer and the relay server and
//! serialize to the `{role, content}` shape the inference backend expects.

use serde::{Deserialize, Serialize};

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Prepend the derived system turn, if any, to the caller's turns.
pub fn with_system_turn(turns: &[ChatTurn], system: Option<String>) -> Vec<ChatTurn> {
    let mut out = Vec::with_capacity(turns.len() + 1);
    if let Some(prompt) = system {
        out.push(ChatTurn::system(prompt));
    }
    out.extend(turns.iter().cloned());
    out
}
