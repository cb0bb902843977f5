// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-sink trait: where a finished turn is pushed when the requester is
//! on a different channel than the web UI.

use async_trait::async_trait;

use crate::error::MantisError;
use crate::types::Step;

/// A file queued for delivery alongside the reply text.
#[derive(Debug, Clone, Default)]
pub struct FileAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub caption: String,
}

/// The finished turn as handed to a response sink.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRequest {
    pub text: String,
    pub steps: Vec<Step>,
    pub files: Vec<FileAttachment>,
}

/// A delivery endpoint bound to one recipient.
#[async_trait]
pub trait ResponseTo: Send + Sync {
    /// Delivers the finished turn.
    async fn execute(&self, req: DeliveryRequest) -> Result<(), MantisError>;

    /// Recipient address on the channel (e.g. a Telegram chat id).
    fn recipient(&self) -> &str;

    /// Channel name, e.g. "telegram".
    fn channel(&self) -> &str;
}
