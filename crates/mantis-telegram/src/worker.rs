// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One long-poll worker per configured Telegram channel.
//!
//! Polls `getUpdates` with a 30 second timeout, filters senders against the
//! channel's allow-list, downloads attachments up to 10 MiB, keeps a typing
//! indicator alive while the turn runs, and delivers replies through the
//! Markdown fallback ladder.

use std::sync::Arc;
use std::time::Duration;

use mantis_core::traits::delivery::FileAttachment;
use mantis_core::types::Channel;
use mantis_core::MantisError;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, CallbackQuery, ChatAction, ChatId, Message, UpdateKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{Reply, TelegramHandler};
use crate::markdown::{split_message, MAX_MESSAGE_LEN};
use crate::sender::{long_poll_bot, send_with_fallback};

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u32 = 30;

/// Typing indicator refresh period.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Attachment download cap.
const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// A running bot bound to one channel row.
pub struct BotWorker {
    bot: Bot,
    channel_id: String,
    allowed: Vec<i64>,
    handler: Arc<TelegramHandler>,
}

impl BotWorker {
    pub fn new(channel: &Channel, handler: Arc<TelegramHandler>) -> Self {
        BotWorker {
            bot: long_poll_bot(&channel.token),
            channel_id: channel.id.clone(),
            allowed: channel.allowed_user_ids.clone(),
            handler,
        }
    }

    fn is_allowed(&self, user_id: Option<i64>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        user_id.is_some_and(|id| self.allowed.contains(&id))
    }

    /// Runs the poll loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Best-effort: register bot commands so they show up in the UI.
        if let Err(err) = self
            .bot
            .set_my_commands(vec![
                BotCommand::new("start", "Start / show welcome message"),
                BotCommand::new("model", "Switch model"),
                BotCommand::new("reset", "Reset chat context"),
                BotCommand::new("voice", "Read last message aloud"),
            ])
            .await
        {
            warn!(error = %err, "telegram: setMyCommands failed");
        }

        info!(channel_id = self.channel_id.as_str(), "telegram: bot started");
        let mut offset: i32 = 0;
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.bot.get_updates().offset(offset).timeout(POLL_TIMEOUT_SECS) => result,
            };
            let updates = match updates {
                Ok(updates) => updates,
                Err(err) => {
                    warn!(error = %err, "telegram: getUpdates failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            for update in updates {
                offset = update.id + 1;
                match update.kind {
                    UpdateKind::Message(message) => {
                        if !self.is_allowed(message.from().map(|u| u.id.0 as i64)) {
                            continue;
                        }
                        if message.text().is_none()
                            && message.caption().is_none()
                            && message.document().is_none()
                            && message.audio().is_none()
                            && message.voice().is_none()
                            && message.photo().map_or(true, |p| p.is_empty())
                        {
                            continue;
                        }
                        let worker = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move { worker.handle_message(message, cancel).await });
                    }
                    UpdateKind::CallbackQuery(query) => {
                        if !self.is_allowed(Some(query.from.id.0 as i64)) {
                            continue;
                        }
                        let worker = self.clone();
                        tokio::spawn(async move { worker.handle_callback(query).await });
                    }
                    _ => {}
                }
            }
        }
    }

    async fn handle_message(self: Arc<Self>, message: Message, cancel: CancellationToken) {
        let chat_id = message.chat.id;

        let typing = cancel.child_token();
        {
            let bot = self.bot.clone();
            let typing = typing.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TYPING_INTERVAL);
                loop {
                    tokio::select! {
                        _ = typing.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(err) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
                                debug!(error = %err, "typing indicator failed");
                            }
                        }
                    }
                }
            });
        }

        let result = self.process_message(&message, chat_id).await;
        typing.cancel();

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => Reply {
                text: format!("Error: {err}"),
                ..Default::default()
            },
        };
        self.send_reply(chat_id, reply).await;
    }

    async fn process_message(
        &self,
        message: &Message,
        chat_id: ChatId,
    ) -> Result<Reply, MantisError> {
        let mut text = message
            .text()
            .or_else(|| message.caption())
            .unwrap_or_default()
            .to_string();

        let mut incoming: Vec<FileAttachment> = Vec::new();
        if let Some(document) = message.document() {
            let name = document
                .file_name
                .clone()
                .unwrap_or_else(|| "document".into());
            let mime = document
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default();
            incoming.push(self.fetch_attachment(&document.file.id, document.file.size as u64, name, mime).await?);
        }
        if let Some(audio) = message.audio() {
            let name = audio.file_name.clone().unwrap_or_else(|| "audio".into());
            let mime = audio
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default();
            incoming.push(self.fetch_attachment(&audio.file.id, audio.file.size as u64, name, mime).await?);
        }
        if let Some(voice) = message.voice() {
            // Voice notes are OGG/OPUS; the fixed name routes them through
            // transcription.
            let mime = voice
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default();
            incoming.push(
                self.fetch_attachment(&voice.file.id, voice.file.size as u64, "voice.ogg".into(), mime)
                    .await?,
            );
        }
        if let Some(photos) = message.photo() {
            if let Some(best) = photos.last() {
                let name = format!("photo_{}.jpg", chrono::Utc::now().format("%Y%m%d_%H%M%S"));
                incoming.push(
                    self.fetch_attachment(&best.file.id, best.file.size as u64, name, "image/jpeg".into())
                        .await?,
                );
            }
        }

        if text.is_empty() && !incoming.is_empty() {
            text = "User attached file(s).".into();
        }

        self.handler
            .execute(&self.channel_id, &chat_id.to_string(), &text, incoming)
            .await
    }

    async fn fetch_attachment(
        &self,
        file_id: &str,
        declared_size: u64,
        name: String,
        mime: String,
    ) -> Result<FileAttachment, MantisError> {
        if declared_size > MAX_ATTACHMENT_BYTES {
            return Err(MantisError::Validation(format!(
                "file too large ({declared_size} bytes, max {MAX_ATTACHMENT_BYTES})"
            )));
        }
        let file = self
            .bot
            .get_file(file_id.to_string())
            .await
            .map_err(|e| MantisError::Channel {
                message: format!("telegram getFile: {e}"),
                source: Some(Box::new(e)),
            })?;

        let mut cursor = std::io::Cursor::new(Vec::new());
        self.bot
            .download_file(&file.path, &mut cursor)
            .await
            .map_err(|e| MantisError::Channel {
                message: format!("telegram download: {e}"),
                source: Some(Box::new(e)),
            })?;
        let data = cursor.into_inner();
        if data.len() as u64 > MAX_ATTACHMENT_BYTES {
            return Err(MantisError::Validation(format!(
                "file too large ({} bytes, max {MAX_ATTACHMENT_BYTES})",
                data.len()
            )));
        }

        Ok(FileAttachment {
            file_name: name,
            mime_type: mime,
            data,
            caption: String::new(),
        })
    }

    async fn handle_callback(self: Arc<Self>, query: CallbackQuery) {
        // Stop the loading spinner regardless of what happens next.
        if let Err(err) = self.bot.answer_callback_query(query.id.clone()).await {
            debug!(error = %err, "answerCallbackQuery failed");
        }

        let Some(message) = &query.message else { return };
        let chat_id = message.chat.id;
        let Some(data) = query.data.as_deref() else {
            return;
        };

        // Callback data routes back into the text command handlers.
        let text = match data.strip_prefix("model:") {
            Some(id) if !id.trim().is_empty() => format!("/model {}", id.trim()),
            _ => return,
        };

        let reply = match self
            .handler
            .execute(&self.channel_id, &chat_id.to_string(), &text, Vec::new())
            .await
        {
            Ok(reply) => reply,
            Err(err) => Reply {
                text: format!("Error: {err}"),
                ..Default::default()
            },
        };
        self.send_reply(chat_id, reply).await;
    }

    async fn send_reply(&self, chat_id: ChatId, reply: Reply) {
        if reply.text.is_empty() {
            return;
        }
        let mut markup = reply.reply_markup;
        for chunk in split_message(&reply.text, MAX_MESSAGE_LEN) {
            if let Err(err) = send_with_fallback(&self.bot, chat_id, &chunk, markup.take()).await {
                warn!(error = %err, "telegram: sendMessage failed");
            }
        }
    }
}
