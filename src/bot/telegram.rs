//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    FileId, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, ReplyParameters,
};
use tracing::{info, warn};

use crate::pipeline::retry::Notifier;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<i64, String> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);

        if let Some(msg_id) = reply_to_message_id {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }
        if let Some(kb) = keyboard {
            request = request.reply_markup(kb);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Edit an earlier message in place, replacing text and keyboard.
    pub async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), String> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), text)
            .parse_mode(ParseMode::Html);

        if let Some(kb) = keyboard {
            request = request.reply_markup(kb);
        }

        request.await.map(|_| ()).map_err(|e| {
            let msg = format!("Failed to edit message: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Swap only the inline keyboard of an earlier message.
    pub async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<(), String> {
        self.bot
            .edit_message_reply_markup(ChatId(chat_id), MessageId(message_id as i32))
            .reply_markup(keyboard)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to edit keyboard: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Delete a message.
    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to delete message: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Download a file (voice or video note) by file_id.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        info!("📥 Downloaded file ({} bytes)", data.len());
        Ok(data)
    }

    /// Send a transcript as a text document.
    pub async fn send_document(
        &self,
        chat_id: i64,
        data: Vec<u8>,
        file_name: &str,
    ) -> Result<(), String> {
        let input_file = InputFile::memory(data).file_name(file_name.to_string());
        self.bot
            .send_document(ChatId(chat_id), input_file)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to send document: {e}");
                warn!("{}", msg);
                msg
            })
    }
}

/// Per-chat notifier used by the retry client for its single failure notice.
pub struct ChatNotifier {
    client: std::sync::Arc<TelegramClient>,
    chat_id: i64,
}

impl ChatNotifier {
    pub fn new(client: std::sync::Arc<TelegramClient>, chat_id: i64) -> Self {
        Self { client, chat_id }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn notify_failure(&self, text: &str) -> bool {
        self.client.send_message(self.chat_id, text, None, None).await.is_ok()
    }
}
