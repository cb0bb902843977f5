// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Auxiliary media adapters: speech-to-text, text-to-speech, OCR.

pub mod asr;
pub mod ocr;
pub mod tts;

pub use asr::AsrClient;
pub use ocr::OcrClient;
pub use tts::TtsClient;
