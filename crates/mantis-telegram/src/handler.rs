// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-channel message handling: slash commands, voice transcription,
//! attachment intake, and the hand-off to the workflow.

use std::sync::Arc;

use mantis_agent::{
    Buffer, Finally, ModelQuery, SessionMode, SessionPolicy, Workflow, WorkflowInput,
};
use mantis_core::traits::delivery::FileAttachment;
use mantis_core::traits::store::get_one;
use mantis_core::types::{Channel, ChatMessage, ListQuery, Model, Page, Sort, SortDir};
use mantis_core::{Asr, MantisError, Store, Tts, TtsRequest};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::sync::oneshot;
use tracing::warn;

use crate::sender::TelegramSender;

/// What the worker should send back, if anything.
#[derive(Default)]
pub struct Reply {
    pub text: String,
    pub reply_markup: Option<InlineKeyboardMarkup>,
}

/// Maximum text length read aloud by `/voice`.
const MAX_TTS_LEN: usize = 2000;

/// Channel-scoped message handler shared by all bot workers.
pub struct TelegramHandler {
    channel_store: Arc<dyn Store<Channel>>,
    message_store: Arc<dyn Store<ChatMessage>>,
    model_store: Arc<dyn Store<Model>>,
    session_policy: Arc<SessionPolicy>,
    workflow: Arc<Workflow>,
    buffer: Arc<Buffer>,
    asr: Option<Arc<dyn Asr>>,
    tts: Option<Arc<dyn Tts>>,
}

impl TelegramHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_store: Arc<dyn Store<Channel>>,
        message_store: Arc<dyn Store<ChatMessage>>,
        model_store: Arc<dyn Store<Model>>,
        session_policy: Arc<SessionPolicy>,
        workflow: Arc<Workflow>,
        buffer: Arc<Buffer>,
        asr: Option<Arc<dyn Asr>>,
        tts: Option<Arc<dyn Tts>>,
    ) -> Self {
        TelegramHandler {
            channel_store,
            message_store,
            model_store,
            session_policy,
            workflow,
            buffer,
            asr,
            tts,
        }
    }

    /// Handles one inbound message or routed callback.
    pub async fn execute(
        &self,
        channel_id: &str,
        chat_id: &str,
        text: &str,
        incoming: Vec<FileAttachment>,
    ) -> Result<Reply, MantisError> {
        if let Some((command, args)) = parse_slash_command(text) {
            match command.as_str() {
                "start" => {
                    let _ = self.get_or_create_session().await;
                    return Ok(Reply {
                        text: "Mantis\n\nSend a message to get started.\nCommands are available via the Menu button.\n\n/model - switch model\n/reset - reset context\n/voice - read last message aloud".into(),
                        ..Default::default()
                    });
                }
                "reset" => {
                    self.session_policy.execute(SessionMode::CreateNew).await?;
                    return Ok(Reply {
                        text: "Context reset. Send a new message to start fresh.".into(),
                        ..Default::default()
                    });
                }
                "model" => return self.model_command(channel_id, &args).await,
                "voice" => return self.voice_command(channel_id, chat_id).await,
                _ => {}
            }
        }

        let session_id = self.get_or_create_session().await?;
        let sender = Arc::new(self.create_sender(channel_id, chat_id).await?);

        let (incoming, text) = self
            .transcribe_voice_notes(&sender, incoming, text.to_string())
            .await;

        let (done_tx, done_rx) = oneshot::channel();
        let out = self
            .workflow
            .execute(WorkflowInput {
                session_id,
                content: text,
                incoming,
                model_query: ModelQuery {
                    channel_id: channel_id.to_string(),
                    ..Default::default()
                },
                response_to: Some(sender.clone()),
                source: "telegram".into(),
                disable_history: false,
                error_prefix: "[Error]".into(),
                timeout: std::time::Duration::ZERO,
                finally: Finally::new(move || {
                    let _ = done_tx.send(());
                }),
            })
            .await?;

        sender
            .stream_from(&self.buffer, &out.assistant_message.id, done_rx)
            .await;
        Ok(Reply::default())
    }

    async fn get_or_create_session(&self) -> Result<String, MantisError> {
        let outcome = self
            .session_policy
            .execute(SessionMode::LatestOrCreate {
                exclude_prefixes: vec!["cron:".into()],
            })
            .await;
        match outcome {
            Ok(outcome) => Ok(outcome.session.id),
            // Fall back to a fresh session rather than dropping the message.
            Err(_) => Ok(self
                .session_policy
                .execute(SessionMode::CreateNew)
                .await?
                .session
                .id),
        }
    }

    async fn create_sender(
        &self,
        channel_id: &str,
        chat_id: &str,
    ) -> Result<TelegramSender, MantisError> {
        let channel = get_one(self.channel_store.as_ref(), channel_id)
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("channel {channel_id:?} not found")))?;
        if channel.token.is_empty() {
            return Err(MantisError::Validation(format!(
                "channel {channel_id:?} has no token"
            )));
        }
        Ok(TelegramSender::new(&channel.token, chat_id))
    }

    /// Replaces voice notes with their transcription, echoing the recognised
    /// text back as a quote.
    async fn transcribe_voice_notes(
        &self,
        sender: &TelegramSender,
        files: Vec<FileAttachment>,
        mut text: String,
    ) -> (Vec<FileAttachment>, String) {
        let Some(asr) = &self.asr else {
            return (files, text);
        };

        let mut kept = Vec::with_capacity(files.len());
        for file in files {
            if file.file_name != "voice.ogg" {
                kept.push(file);
                continue;
            }
            let format = file
                .mime_type
                .strip_prefix("audio/")
                .unwrap_or("ogg")
                .to_string();
            let transcription = match asr.transcribe(&file.data, &format).await {
                Ok(result) => result.trim().to_string(),
                Err(err) => {
                    warn!(error = %err, "asr: transcribe failed");
                    kept.push(file);
                    continue;
                }
            };
            if transcription.is_empty() {
                continue;
            }
            sender.send_quote(&format!("🎤 {transcription}")).await;
            if text.is_empty() || text == "User attached file(s)." {
                text = transcription;
            } else {
                text = format!("{transcription}\n\n{text}");
            }
        }
        (kept, text)
    }

    async fn model_command(&self, channel_id: &str, args: &str) -> Result<Reply, MantisError> {
        let arg = args.trim();
        if arg.is_empty() || arg == "list" {
            let current = self.channel_model_id(channel_id).await?;
            return self.model_list_reply(&current).await;
        }

        let new_id = arg.split_whitespace().next().unwrap_or_default();
        let Some(model) = get_one(self.model_store.as_ref(), new_id).await? else {
            return Ok(Reply {
                text: format!("Model not found: {new_id}"),
                ..Default::default()
            });
        };

        let mut channel = get_one(self.channel_store.as_ref(), channel_id)
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("channel {channel_id:?} not found")))?;
        channel.model_id = new_id.to_string();
        self.channel_store.update(vec![channel]).await?;

        Ok(Reply {
            text: format!("Model switched: {} ({})", model.name, model.id),
            ..Default::default()
        })
    }

    async fn channel_model_id(&self, channel_id: &str) -> Result<String, MantisError> {
        let channel = get_one(self.channel_store.as_ref(), channel_id)
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("channel {channel_id:?} not found")))?;
        Ok(channel.model_id.trim().to_string())
    }

    async fn model_list_reply(&self, current_id: &str) -> Result<Reply, MantisError> {
        let mut models = self.model_store.list(ListQuery::default()).await?;
        models.sort_by(|a, b| a.name.cmp(&b.name));

        let current_name = models
            .iter()
            .find(|m| m.id == current_id)
            .map(|m| m.name.clone());

        let mut text = if current_id.is_empty() {
            "Select a model.\n".to_string()
        } else if let Some(name) = current_name {
            format!("Current model: {name}\n")
        } else {
            format!("Current model: {current_id}\n")
        };
        if models.is_empty() {
            text.push_str("\nNo models available. Create one in the web panel.");
            return Ok(Reply {
                text: text.trim().to_string(),
                ..Default::default()
            });
        }
        text.push_str("\nTap a button to switch model.");

        let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
        let mut row: Vec<InlineKeyboardButton> = Vec::new();
        for model in &models {
            let mut label = model.name.clone();
            if model.id == current_id {
                label = format!("✅ {label}");
            }
            row.push(InlineKeyboardButton::callback(
                label,
                format!("model:{}", model.id),
            ));
            if row.len() == 2 {
                rows.push(std::mem::take(&mut row));
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }

        Ok(Reply {
            text: text.trim().to_string(),
            reply_markup: Some(InlineKeyboardMarkup::new(rows)),
        })
    }

    async fn voice_command(&self, channel_id: &str, chat_id: &str) -> Result<Reply, MantisError> {
        let Some(tts) = &self.tts else {
            return Ok(Reply {
                text: "TTS is not configured.".into(),
                ..Default::default()
            });
        };

        let session_id = self.get_or_create_session().await?;
        let mut query = ListQuery::filter_eq("sessionId", session_id);
        query.filter.insert("role".into(), "assistant".into());
        query.sort = vec![Sort {
            field: "createdAt".into(),
            dir: SortDir::Desc,
        }];
        query.page = Page {
            limit: 1,
            offset: 0,
        };
        let messages = self.message_store.list(query).await?;
        let Some(last) = messages.first() else {
            return Ok(Reply {
                text: "No messages to read aloud.".into(),
                ..Default::default()
            });
        };

        let mut text = last.content.trim().to_string();
        if text.is_empty() {
            return Ok(Reply {
                text: "Last message is empty.".into(),
                ..Default::default()
            });
        }
        if text.len() > MAX_TTS_LEN {
            let mut cut = MAX_TTS_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        let audio = match tts
            .synthesize(TtsRequest {
                text,
                format: "wav".into(),
                ..Default::default()
            })
            .await
        {
            Ok(audio) => audio,
            Err(err) => {
                return Ok(Reply {
                    text: format!("TTS error: {err}"),
                    ..Default::default()
                })
            }
        };

        let sender = self.create_sender(channel_id, chat_id).await?;
        if let Err(err) = sender.send_voice(audio).await {
            return Ok(Reply {
                text: format!("Send error: {err}"),
                ..Default::default()
            });
        }
        Ok(Reply::default())
    }
}

/// Splits "/cmd@bot args" into a lower-cased command and its argument tail.
pub fn parse_slash_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    let first = fields.next()?;
    let mut command = first.trim_start_matches('/');
    if let Some(at) = command.find('@') {
        command = &command[..at];
    }
    let args = trimmed[first.len()..].trim().to_string();
    Some((command.to_lowercase(), args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_are_parsed() {
        assert_eq!(
            parse_slash_command("/model list"),
            Some(("model".into(), "list".into()))
        );
        assert_eq!(
            parse_slash_command("/Model@mantis_bot m-1"),
            Some(("model".into(), "m-1".into()))
        );
        assert_eq!(parse_slash_command("  /reset  "), Some(("reset".into(), String::new())));
        assert_eq!(parse_slash_command("hello"), None);
    }
}
