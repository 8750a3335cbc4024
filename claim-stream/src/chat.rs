use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{Result, StreamError},
    text::Utf8Decoder,
};

/// Content shown in place of an answer whose stream failed
pub const CHAT_ERROR_MESSAGE: &str =
    "Sorry, I couldn't finish answering that question. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of the follow-up conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Assistant turn still receiving chunks
    #[serde(default)]
    pub open: bool,
}

impl ChatTurn {
    fn new(role: ChatRole, content: String, open: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            created_at: Utc::now(),
            open,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content.into(), false)
    }

    pub fn assistant_open() -> Self {
        Self::new(ChatRole::Assistant, String::new(), true)
    }
}

/// Ordered chat turns with at most one open assistant turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn open_turn(&self) -> Option<&ChatTurn> {
        self.turns.iter().rev().find(|t| t.open)
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> ChatTurn {
        let turn = ChatTurn::user(content);
        self.turns.push(turn.clone());
        turn
    }

    /// Open a new assistant turn. Fails if one is already streaming.
    pub fn open_assistant(&mut self) -> Result<ChatTurn> {
        if self.open_turn().is_some() {
            return Err(StreamError::ChatBusy);
        }
        let turn = ChatTurn::assistant_open();
        self.turns.push(turn.clone());
        Ok(turn)
    }

    /// Replace the content of the open assistant turn
    pub fn update_open(&mut self, content: &str) -> Option<&ChatTurn> {
        let turn = self.turns.iter_mut().rev().find(|t| t.open)?;
        turn.content.clear();
        turn.content.push_str(content);
        Some(turn)
    }

    /// Freeze the open assistant turn, optionally overwriting its content.
    pub fn seal_open(&mut self, content: Option<&str>) -> Option<ChatTurn> {
        let turn = self.turns.iter_mut().rev().find(|t| t.open)?;
        if let Some(content) = content {
            turn.content = content.to_string();
        }
        turn.open = false;
        Some(turn.clone())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Concatenates an unframed text stream into one growing answer
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: Utf8Decoder,
    content: String,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return everything accumulated so far
    pub fn push(&mut self, chunk: &[u8]) -> &str {
        let text = self.text.decode(chunk);
        self.content.push_str(&text);
        &self.content
    }

    /// Flush bytes held back at end of stream and return the final text
    pub fn finish(mut self) -> String {
        let rest = self.text.finish();
        self.content.push_str(&rest);
        self.content
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Receives chat notifications while an answer streams
pub trait ChatObserver: Send + Sync {
    fn on_turn_opened(&self, _turn: &ChatTurn) {}

    /// Full content of the open turn after the latest chunk
    fn on_chunk(&self, _turn_id: Uuid, _content: &str) {}

    /// The turn is final; `failed` is set when the content is the error message
    fn on_turn_sealed(&self, _turn: &ChatTurn, _failed: bool) {}
}
