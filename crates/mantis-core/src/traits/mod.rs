// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter traits implemented by the infrastructure crates.

pub mod delivery;
pub mod llm;
pub mod media;
pub mod store;

pub use delivery::{DeliveryRequest, FileAttachment, ResponseTo};
pub use llm::{ChatRequest, ChatStreamer, LlmMessage, VisionLlm};
pub use media::{Asr, Ocr, Tts, TtsRequest};
pub use store::{get_one, Store};
