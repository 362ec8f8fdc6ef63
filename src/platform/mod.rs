pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::NotifyTarget;

/// Who sent an event. The identity keys both conversations and sheet rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: u64,
    pub username: Option<String>,
}

impl Requester {
    /// Username if the user has one, otherwise `id:<numeric id>`
    pub fn identity(&self) -> String {
        match self.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.trim_start_matches('@').to_string(),
            _ => format!("id:{}", self.user_id),
        }
    }
}

/// Platform-specific chat id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatRef(pub i64);

/// An event received from the chat platform
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub requester: Requester,
    pub chat: ChatRef,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `/name` with the bot suffix and arguments stripped
    Command(String),
    Text(String),
    /// Button press. `data` is the opaque payload set on the button.
    Callback {
        id: String,
        data: String,
        message_id: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

/// Inline keyboard, one inner Vec per row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    /// One button per row
    pub fn column(buttons: impl IntoIterator<Item = Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Option<Keyboard>,
    /// Replace the message whose button was pressed instead of sending a new one
    pub edit_origin: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
            edit_origin: false,
        }
    }

    pub fn with_keyboard(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Self {
            text: text.into(),
            keyboard: Some(keyboard),
            edit_origin: false,
        }
    }

    pub fn editing(mut self) -> Self {
        self.edit_origin = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("{0}")]
    Other(String),
}

/// Outbound side of the chat platform
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, chat: ChatRef, reply: &Reply) -> Result<(), TransportError>;

    async fn edit(
        &self,
        chat: ChatRef,
        message_id: i32,
        reply: &Reply,
    ) -> Result<(), TransportError>;

    async fn notify(&self, target: &NotifyTarget, text: &str) -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;

    async fn send_document(
        &self,
        chat: ChatRef,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), TransportError>;
}
