// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Mantis agent system.
//!
//! Provides the entity types, stream-event bus, tool catalogue types, the
//! workspace error type, and the adapter traits implemented by the
//! infrastructure crates.

pub mod error;
pub mod stream;
pub mod tool;
pub mod traits;
pub mod types;

pub use error::MantisError;
pub use stream::{EventKind, EventSender, EventStream, StreamEvent, ToolCall, STREAM_BUFFER};
pub use tool::{ToolContext, ToolDefinition, ToolDispatcher, ToolKind, ToolMeta, ToolMetaSlot, ToolSpec};
pub use traits::{
    Asr, ChatRequest, ChatStreamer, DeliveryRequest, FileAttachment, LlmMessage, Ocr, ResponseTo,
    Store, Tts, TtsRequest, VisionLlm,
};
