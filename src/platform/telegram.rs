use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, Recipient,
};
use tracing::{debug, info, warn};

use crate::bot::App;
use crate::config::NotifyTarget;
use crate::platform::{
    ChatRef, ChatTransport, EventKind, IncomingEvent, Keyboard, Reply,
    Requester as ChatRequester, TransportError,
};

/// Stay under Telegram's 4096 char message limit
const MAX_MESSAGE_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

fn markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.payload.clone()))
            .collect::<Vec<_>>()
    }))
}

/// Strip the slash, any `@botname` suffix and arguments
fn parse_command(text: &str) -> Option<String> {
    let word = text.trim().strip_prefix('/')?.split_whitespace().next()?;
    let name = word.split('@').next().unwrap_or(word);
    (!name.is_empty()).then(|| name.to_lowercase())
}

fn requester(user: &teloxide::types::User) -> ChatRequester {
    ChatRequester {
        user_id: user.id.0,
        username: user.username.clone(),
    }
}

/// `ChatTransport` backed by the Telegram Bot API
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(&self, chat: ChatRef, reply: &Reply) -> Result<(), TransportError> {
        let chunks = split_message(&reply.text, MAX_MESSAGE_LEN);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let request = self.bot.send_message(ChatId(chat.0), chunk);
            // keyboard goes on the final chunk so it sits under the whole text
            match (&reply.keyboard, i == last) {
                (Some(keyboard), true) => request.reply_markup(markup(keyboard)).await?,
                _ => request.await?,
            };
        }
        Ok(())
    }

    async fn edit(
        &self,
        chat: ChatRef,
        message_id: i32,
        reply: &Reply,
    ) -> Result<(), TransportError> {
        if reply.text.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Other(
                "reply too long to edit in place".to_string(),
            ));
        }
        let request = self
            .bot
            .edit_message_text(ChatId(chat.0), MessageId(message_id), reply.text.clone());
        match &reply.keyboard {
            Some(keyboard) => request.reply_markup(markup(keyboard)).await?,
            None => request.await?,
        };
        Ok(())
    }

    async fn notify(&self, target: &NotifyTarget, text: &str) -> Result<(), TransportError> {
        let recipient = match target {
            NotifyTarget::Chat(id) => Recipient::Id(ChatId(*id)),
            NotifyTarget::Channel(name) => Recipient::ChannelUsername(name.clone()),
        };
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.bot.send_message(recipient.clone(), chunk).await?;
        }
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.bot
            .answer_callback_query(CallbackQueryId(callback_id.to_string()))
            .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: ChatRef,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), TransportError> {
        let file = InputFile::memory(content).file_name(file_name.to_string());
        self.bot.send_document(ChatId(chat.0), file).await?;
        Ok(())
    }
}

/// Run the Telegram bot platform
pub async fn run(app: Arc<App>, bot: Bot) -> Result<()> {
    info!("Starting Telegram platform...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![app])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(msg: Message, app: Arc<App>) -> ResponseResult<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };

    let text = match msg.text() {
        Some(t) => t,
        None => {
            debug!("Ignoring non-text message from {}", user.id);
            return Ok(());
        }
    };

    let kind = match parse_command(text) {
        Some(command) => EventKind::Command(command),
        None => EventKind::Text(text.to_string()),
    };

    let event = IncomingEvent {
        requester: requester(user),
        chat: ChatRef(msg.chat.id.0),
        kind,
    };
    app.handle(event).await;
    Ok(())
}

async fn handle_callback(q: CallbackQuery, app: Arc<App>) -> ResponseResult<()> {
    let (chat, message_id) = match q.message.as_ref() {
        Some(message) => (ChatRef(message.chat().id.0), Some(message.id().0)),
        // Buttons on inline messages have no chat to answer in
        None => (ChatRef(q.from.id.0 as i64), None),
    };

    let event = IncomingEvent {
        requester: requester(&q.from),
        chat,
        kind: EventKind::Callback {
            id: q.id.0.clone(),
            data: q.data.clone().unwrap_or_default(),
            message_id,
        },
    };
    app.handle(event).await;
    Ok(())
}
