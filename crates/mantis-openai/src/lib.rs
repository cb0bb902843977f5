// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI-compatible LLM adapters: streaming chat completions, the thinking
//! filter, and a vision client.

pub mod client;
pub mod thinking;
pub mod vision;

pub use client::OpenAiClient;
pub use thinking::{apply_thinking_mode, apply_thinking_stream};
pub use vision::VisionClient;
