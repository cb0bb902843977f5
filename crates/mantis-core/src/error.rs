// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Mantis agent system.

use thiserror::Error;

/// The primary error type used across all Mantis crates.
///
/// Variants map to the error kinds the system distinguishes: missing records,
/// malformed input, transient I/O against external systems, and per-request
/// timeouts. Guard violations are deliberately *not* errors: they become
/// successful tool results so the LLM can adapt.
#[derive(Debug, Error)]
pub enum MantisError {
    /// A record referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input (invalid cron expression, unknown channel type, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage backend errors (connection, query failure, serialization).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// LLM endpoint errors (HTTP failure, bad status, stream read).
    #[error("llm error: {message}")]
    Llm {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// SSH dial/exec/SFTP errors.
    #[error("ssh error: {message}")]
    Ssh {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Delivery channel errors (Telegram API failure, bad recipient).
    #[error("channel error: {message}")]
    Channel {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Auxiliary media service errors (ASR, TTS, OCR, vision).
    #[error("media error: {message}")]
    Media {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MantisError {
    /// Convenience constructor for LLM errors without a source.
    pub fn llm(message: impl Into<String>) -> Self {
        MantisError::Llm {
            message: message.into(),
            source: None,
        }
    }

    /// Convenience constructor for SSH errors without a source.
    pub fn ssh(message: impl Into<String>) -> Self {
        MantisError::Ssh {
            message: message.into(),
            source: None,
        }
    }

    /// Convenience constructor for media errors without a source.
    pub fn media(message: impl Into<String>) -> Self {
        MantisError::Media {
            message: message.into(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for MantisError {
    fn from(err: serde_json::Error) -> Self {
        MantisError::Validation(format!("invalid JSON: {err}"))
    }
}
