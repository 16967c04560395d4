use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One typed unit of displayable output inside a turn. Items render
/// top-to-bottom in the order they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// Natural-language reply text, accumulated from streamed deltas.
    Text { content: String },
    /// Source code the assistant writes for the interpreter.
    CodeInput { content: String },
    /// Captured execution log output.
    CodeOutput { content: String },
    /// Rendered charts as inline `data:image/png;base64,...` URLs.
    Image { content: Vec<String> },
}

impl ContentItem {
    pub fn empty_text() -> Self {
        ContentItem::Text { content: String::new() }
    }

    pub fn empty_code_input() -> Self {
        ContentItem::CodeInput { content: String::new() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentItem::Text { .. } => "text",
            ContentItem::CodeInput { .. } => "code_input",
            ContentItem::CodeOutput { .. } => "code_output",
            ContentItem::Image { .. } => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user or assistant contribution to the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub items: Vec<ContentItem>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            items: vec![ContentItem::Text { content: prompt.into() }],
            created_at: Utc::now(),
        }
    }

    pub fn assistant(items: Vec<ContentItem>) -> Self {
        Self {
            role: Role::Assistant,
            items,
            created_at: Utc::now(),
        }
    }
}

// ── WebSocket protocol ────────────────────────────────────────────────────────

/// Request sent by the browser over the chat WebSocket.
#[derive(Debug, Deserialize)]
pub struct WsChatRequest {
    pub session_id: String,
    pub prompt: String,
}

/// Event streamed back to the browser while a turn is in progress.
///
/// `*_updated` events carry the full accumulated content of the open item, so
/// re-rendering is idempotent: replaying or repainting always produces the
/// same displayed string.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    TurnStarted,
    CodeOpened,
    CodeUpdated { content: String },
    CodeClosed,
    CodeOutputAdded { content: String },
    ImageAdded { content: Vec<String> },
    TextOpened,
    TextUpdated { content: String },
    Notice { message: String },
    TurnCompleted,
    Error { message: String },
}
