// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Strips or unwraps `<think>` reasoning blocks from a stream.
//!
//! Upstream models variably emit reasoning either as a tag span inside `text`
//! deltas (possibly split across many deltas) or as a separate `thinking`
//! event. Because tags arrive token-by-token, text deltas are buffered until a
//! non-text event arrives, then the buffer is rewritten and re-emitted as a
//! single `text` event. An unclosed open tag means "the rest is reasoning".

use std::sync::OnceLock;

use mantis_core::{EventKind, EventStream, StreamEvent, STREAM_BUFFER};
use regex::Regex;
use tokio::sync::mpsc;

// A couple of common tag variants are recognised to make thinking modes more
// reliable across models.
fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<\s*(think|thinking|analysis|reasoning)\b[^>]*>.*?<\s*/\s*(think|thinking|analysis|reasoning)\s*>",
        )
        .unwrap()
    })
}

fn open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<\s*(think|thinking|analysis|reasoning)\b[^>]*>.*$").unwrap()
    })
}

fn tags_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)</?\s*(think|thinking|analysis|reasoning)\b[^>]*>").unwrap()
    })
}

/// Rewrites one complete text buffer under the given mode.
pub fn apply_thinking_mode(content: &str, mode: &str) -> String {
    match mode {
        "skip" => {
            // Remove complete blocks first, then be lenient about a missing
            // closing tag.
            let out = block_re().replace_all(content, "");
            let out = open_re().replace_all(&out, "");
            out.trim().to_string()
        }
        "inline" => tags_re().replace_all(content, "").trim().to_string(),
        _ => content.to_string(),
    }
}

/// Wraps a stream, applying the thinking mode. Mode `""` is the identity.
pub fn apply_thinking_stream(mut src: EventStream, mode: String) -> EventStream {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut text_parts: Vec<String> = Vec::new();

        async fn flush(
            parts: &mut Vec<String>,
            mode: &str,
            tx: &mpsc::Sender<StreamEvent>,
        ) -> bool {
            if parts.is_empty() {
                return true;
            }
            let combined = apply_thinking_mode(&parts.join(""), mode);
            parts.clear();
            if combined.is_empty() {
                return true;
            }
            tx.send(StreamEvent::text(combined)).await.is_ok()
        }

        while let Some(event) = src.recv().await {
            match event.kind {
                EventKind::Text => text_parts.push(event.delta),
                EventKind::Thinking => match mode.as_str() {
                    "skip" => {}
                    "inline" => {
                        if !flush(&mut text_parts, &mode, &tx).await {
                            return;
                        }
                        let mut text = StreamEvent::text(event.delta);
                        text.sequence = event.sequence;
                        if tx.send(text).await.is_err() {
                            return;
                        }
                    }
                    _ => {
                        if !flush(&mut text_parts, &mode, &tx).await {
                            return;
                        }
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                },
                _ => {
                    if !flush(&mut text_parts, &mode, &tx).await {
                        return;
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }

        if !text_parts.is_empty() {
            let combined = apply_thinking_mode(&text_parts.join(""), &mode);
            if !combined.is_empty() {
                let mut event = StreamEvent::text(combined);
                event.is_final = true;
                let _ = tx.send(event).await;
            }
        }
    });
    rx
}
