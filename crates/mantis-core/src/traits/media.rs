// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Auxiliary media service traits: speech-to-text, text-to-speech, OCR.

use async_trait::async_trait;

use crate::error::MantisError;

/// Speech-to-text.
#[async_trait]
pub trait Asr: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, MantisError>;
}

/// Text-to-speech request.
#[derive(Debug, Clone, Default)]
pub struct TtsRequest {
    pub text: String,
    /// Optional reference voice sample; switches the adapter to its
    /// voice-cloning endpoint.
    pub voice: Option<Vec<u8>>,
    pub emotion: String,
    pub instructions: String,
    /// Output audio format, defaults to "wav".
    pub format: String,
}

/// Text-to-speech.
#[async_trait]
pub trait Tts: Send + Sync {
    async fn synthesize(&self, req: TtsRequest) -> Result<Vec<u8>, MantisError>;
}

/// Optical character recognition.
#[async_trait]
pub trait Ocr: Send + Sync {
    async fn extract_text(&self, image: &[u8], format: &str) -> Result<String, MantisError>;
}
