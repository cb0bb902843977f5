// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Telegram response sink.
//!
//! While the pipeline streams, the sink mirrors the live buffer into a single
//! Telegram message via periodic edits (HTML parse mode, escaped, duplicate
//! edits skipped). On final delivery it sends queued files first, deletes the
//! streaming message best-effort, and sends only the content tail not already
//! covered by tool steps. Outbound text goes through a MarkdownV2 ->
//! Markdown -> plain fallback ladder.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mantis_agent::Buffer;
use mantis_core::traits::delivery::{DeliveryRequest, ResponseTo};
use mantis_core::types::Step;
use mantis_core::MantisError;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ParseMode};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::markdown::{escape_html, normalize_markdown_v2, split_message, MAX_MESSAGE_LEN};

/// How often the streaming preview message is edited.
const STREAM_INTERVAL: Duration = Duration::from_secs(3);

/// A response sink bound to one Telegram chat.
pub struct TelegramSender {
    bot: Bot,
    recipient: String,
    stream_msg_id: AtomicI32,
}

/// A bot whose HTTP client tolerates long polls and large uploads.
pub fn long_poll_bot(token: &str) -> Bot {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .expect("reqwest client");
    Bot::with_client(token, client)
}

impl TelegramSender {
    pub fn new(token: &str, recipient: &str) -> Self {
        TelegramSender {
            bot: long_poll_bot(token.trim()),
            recipient: recipient.trim().to_string(),
            stream_msg_id: AtomicI32::new(0),
        }
    }

    fn chat_id(&self) -> Result<ChatId, MantisError> {
        self.recipient
            .parse::<i64>()
            .map(ChatId)
            .map_err(|e| MantisError::Channel {
                message: format!("invalid telegram recipient {:?}: {e}", self.recipient),
                source: Some(Box::new(e)),
            })
    }

    /// Mirrors the buffer entry for `buffer_id` into one streamed message
    /// until `done` fires.
    pub async fn stream_from(&self, buffer: &Buffer, buffer_id: &str, mut done: oneshot::Receiver<()>) {
        let Ok(chat_id) = self.chat_id() else {
            let _ = (&mut done).await;
            return;
        };

        let mut ticker = tokio::time::interval(STREAM_INTERVAL);
        ticker.tick().await;
        let mut last_text = String::new();
        let mut msg_id: Option<MessageId> = None;

        loop {
            tokio::select! {
                _ = &mut done => return,
                _ = ticker.tick() => {
                    let Some(entry) = buffer.get(buffer_id) else { continue };
                    let text = format_stream_html(&entry.content, &entry.steps);
                    if text.is_empty() || text == last_text {
                        continue;
                    }
                    last_text = text.clone();
                    match msg_id {
                        None => {
                            match self
                                .bot
                                .send_message(chat_id, &text)
                                .parse_mode(ParseMode::Html)
                                .await
                            {
                                Ok(sent) => {
                                    msg_id = Some(sent.id);
                                    self.stream_msg_id.store(sent.id.0, Ordering::SeqCst);
                                }
                                Err(err) => debug!(error = %err, "stream: send failed"),
                            }
                        }
                        Some(id) => {
                            if let Err(err) = self
                                .bot
                                .edit_message_text(chat_id, id, &text)
                                .parse_mode(ParseMode::Html)
                                .await
                            {
                                let text = err.to_string();
                                if !text.contains("message is not modified") {
                                    debug!(error = %text, "stream: edit failed");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reads a voice reply into the chat.
    pub async fn send_voice(&self, audio: Vec<u8>) -> Result<(), MantisError> {
        let chat_id = self.chat_id()?;
        self.bot
            .send_voice(chat_id, InputFile::memory(audio).file_name("voice.ogg"))
            .await
            .map_err(channel_err("sendVoice"))?;
        Ok(())
    }

    /// Best-effort short notice, e.g. a transcription echo.
    pub async fn send_quote(&self, text: &str) {
        let Ok(chat_id) = self.chat_id() else { return };
        if let Err(err) = self.bot.send_message(chat_id, text).await {
            debug!(error = %err, "quote send failed");
        }
    }
}

#[async_trait]
impl ResponseTo for TelegramSender {
    async fn execute(&self, req: DeliveryRequest) -> Result<(), MantisError> {
        let chat_id = self.chat_id()?;

        // Files go first so the closing text does not arrive minutes before a
        // slow upload completes.
        for file in &req.files {
            if file.data.is_empty() {
                continue;
            }
            let mut request = self.bot.send_document(
                chat_id,
                InputFile::memory(file.data.clone()).file_name(file.file_name.clone()),
            );
            if !file.caption.is_empty() {
                request = request.caption(file.caption.clone());
            }
            request.await.map_err(channel_err("sendDocument"))?;
        }

        let text = final_text(&req.text, &req.steps);
        if text.is_empty() {
            return Ok(());
        }

        let stream_id = self.stream_msg_id.load(Ordering::SeqCst);
        if stream_id > 0 {
            // Already-deleted messages are fine; delivery continues.
            if let Err(err) = self.bot.delete_message(chat_id, MessageId(stream_id)).await {
                debug!(error = %err, "streaming message delete failed");
            }
        }

        for chunk in split_message(&text, MAX_MESSAGE_LEN) {
            send_with_fallback(&self.bot, chat_id, &chunk, None).await?;
        }
        Ok(())
    }

    fn recipient(&self) -> &str {
        &self.recipient
    }

    fn channel(&self) -> &str {
        "telegram"
    }
}

/// MarkdownV2 -> legacy Markdown -> plain-text delivery ladder.
pub async fn send_with_fallback(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    markup: Option<teloxide::types::InlineKeyboardMarkup>,
) -> Result<(), MantisError> {
    let normalized = normalize_markdown_v2(text);

    let mut request = bot
        .send_message(chat_id, &normalized)
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(markup) = markup.clone() {
        request = request.reply_markup(markup);
    }
    let Err(v2_err) = request.await else {
        return Ok(());
    };

    let mut request = bot
        .send_message(chat_id, &normalized)
        .parse_mode(ParseMode::Markdown);
    if let Some(markup) = markup.clone() {
        request = request.reply_markup(markup);
    }
    if request.await.is_ok() {
        warn!(error = %v2_err, "markdownv2 rejected, sent legacy markdown");
        return Ok(());
    }

    let mut request = bot.send_message(chat_id, text);
    if let Some(markup) = markup {
        request = request.reply_markup(markup);
    }
    request.await.map_err(channel_err("sendMessage"))?;
    warn!(error = %v2_err, "markdown rejected, sent plain text");
    Ok(())
}

fn channel_err(what: &'static str) -> impl Fn(teloxide::RequestError) -> MantisError {
    move |err| MantisError::Channel {
        message: format!("telegram {what}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn format_step_line(step: &Step, html: bool) -> String {
    if html {
        format!("🔧 <b>{}</b>", escape_html(&step.label))
    } else {
        format!("🔧 {}", step.label)
    }
}

/// Interleaves step markers into content by their recorded offsets.
fn interleaved_text(content: &str, steps: &[Step], html: bool) -> String {
    if steps.is_empty() {
        return content.to_string();
    }
    let mut sorted: Vec<&Step> = steps.iter().collect();
    sorted.sort_by_key(|s| s.content_offset);

    let mut out = String::new();
    let mut pos = 0usize;
    for step in sorted {
        let offset = step.content_offset;
        if offset > pos && offset <= content.len() && content.is_char_boundary(offset) {
            let chunk = content[pos..offset].trim();
            if !chunk.is_empty() {
                if html {
                    out.push_str(&escape_html(chunk));
                } else {
                    out.push_str(chunk);
                }
                out.push('\n');
            }
            pos = offset;
        }
        out.push_str(&format_step_line(step, html));
        out.push('\n');
    }
    if pos < content.len() {
        let chunk = content[pos..].trim();
        if !chunk.is_empty() {
            if html {
                out.push_str(&escape_html(chunk));
            } else {
                out.push_str(chunk);
            }
        }
    }
    out.trim().to_string()
}

/// The final delivery text: only the tail past the last step's offset; the
/// earlier content narrated tool calls the user already watched stream by.
fn final_text(content: &str, steps: &[Step]) -> String {
    if steps.is_empty() {
        return content.trim().to_string();
    }
    let max_offset = steps.iter().map(|s| s.content_offset).max().unwrap_or(0);
    if max_offset >= content.len() || !content.is_char_boundary(max_offset) {
        return String::new();
    }
    content[max_offset..].trim().to_string()
}

fn format_stream_html(content: &str, steps: &[Step]) -> String {
    if steps.is_empty() && content.is_empty() {
        return String::new();
    }
    if steps.is_empty() {
        return escape_html(content);
    }
    interleaved_text(content, steps, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(label: &str, offset: usize) -> Step {
        Step {
            id: label.into(),
            label: label.into(),
            content_offset: offset,
            ..Default::default()
        }
    }

    #[test]
    fn interleaves_steps_by_offset() {
        let content = "checking disk now done";
        let steps = vec![step("df", 14)];
        let text = interleaved_text(content, &steps, false);
        assert_eq!(text, "checking disk\n🔧 df\nnow done");
    }

    #[test]
    fn final_text_is_tail_after_last_step() {
        let content = "intro text summary";
        let steps = vec![step("a", 6), step("b", 11)];
        assert_eq!(final_text(content, &steps), "summary");
        assert_eq!(final_text(content, &[]), "intro text summary");

        let all_covered = vec![step("a", content.len())];
        assert_eq!(final_text(content, &all_covered), "");
    }

    #[test]
    fn stream_html_escapes_content() {
        let text = format_stream_html("a < b", &[]);
        assert_eq!(text, "a &lt; b");
        let with_step = format_stream_html("run", &[step("x<y", 0)]);
        assert!(with_step.contains("<b>x&lt;y</b>"));
    }
}
