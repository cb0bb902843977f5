// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tool catalogue.
//!
//! Tools are a tagged sum type rather than a record of closures: each
//! [`ToolKind`] carries the immutable data its execution needs (a connection,
//! a guarded SSH target), and a [`ToolDispatcher`] owns the shared runtime
//! state. This keeps serialized telemetry straightforward and avoids closing
//! over mutable state per call.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::MantisError;
use crate::types::{Connection, SshConfig};

/// What the LLM endpoint needs to know about a tool.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema of the arguments object.
    pub parameters: Value,
}

/// The executable identity of a tool.
#[derive(Debug, Clone)]
pub enum ToolKind {
    /// Run a plain-language task on a host via the SSH sub-agent.
    SshTask { connection: Connection },
    /// SFTP-download a remote file into a temporary artifact.
    SshDownload { connection: Connection },
    /// SFTP-upload a temporary artifact to a host.
    SshUpload { connection: Connection },
    /// List temporary artifacts plus the outgoing queue.
    ArtifactsList,
    /// Binary-safe text preview of an artifact.
    ArtifactReadText,
    /// Queue an artifact for delivery to the requester.
    ArtifactSendToChat,
    /// Speech-to-text on an audio artifact.
    ArtifactTranscribe,
    /// OCR on an image artifact.
    ArtifactOcr,
    /// Vision-model description of an image artifact.
    ArtifactDescribe,
    /// Create a scheduled job.
    CronCreate,
    /// List scheduled jobs.
    CronList,
    /// Delete a scheduled job by id.
    CronDelete,
    /// Pure example tool used for bootstrap.
    Sum,
    /// The SSH sub-agent's single tool: run one guarded shell command.
    ExecuteCommand {
        config: SshConfig,
        profile_ids: Vec<String>,
    },
}

/// A tool as exposed to the agent loop: definition plus identity plus icon.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub icon: &'static str,
    pub parameters: Value,
    pub kind: ToolKind,
}

impl ToolSpec {
    /// The LLM-facing definition of this tool.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Human-readable label for rendering a step, derived purely from the raw
    /// argument text.
    pub fn label(&self, args: &str) -> String {
        match &self.kind {
            ToolKind::SshTask { connection } => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(default)]
                    task: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                let prefix = format!("{}: ", connection.name);
                if input.task.is_empty() {
                    prefix + "task"
                } else if input.task.len() > 40 {
                    format!("{prefix}{}...", truncate_chars(&input.task, 40))
                } else {
                    prefix + &input.task
                }
            }
            ToolKind::SshDownload { connection } => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(rename = "remotePath", default)]
                    remote_path: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if input.remote_path.is_empty() {
                    format!("{}: download file", connection.name)
                } else {
                    format!("{}: download {}", connection.name, input.remote_path)
                }
            }
            ToolKind::SshUpload { connection } => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(rename = "remotePath", default)]
                    remote_path: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if input.remote_path.is_empty() {
                    format!("{}: upload file", connection.name)
                } else {
                    format!("{}: upload {}", connection.name, input.remote_path)
                }
            }
            ToolKind::ArtifactsList => "List artifacts".to_string(),
            ToolKind::ArtifactReadText => artifact_id_label(args, "Read"),
            ToolKind::ArtifactSendToChat => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(rename = "fileName", default)]
                    file_name: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if input.file_name.is_empty() {
                    "Send artifact".to_string()
                } else {
                    format!("Send: {}", input.file_name)
                }
            }
            ToolKind::ArtifactTranscribe => artifact_id_label(args, "Transcribe"),
            ToolKind::ArtifactOcr => artifact_id_label(args, "OCR"),
            ToolKind::ArtifactDescribe => artifact_id_label(args, "Describe"),
            ToolKind::CronCreate => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(default)]
                    name: String,
                    #[serde(default)]
                    schedule: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if !input.name.is_empty() {
                    format!("cron: {}", input.name)
                } else if !input.schedule.is_empty() {
                    format!("cron: {}", input.schedule)
                } else {
                    "cron: create".to_string()
                }
            }
            ToolKind::CronList => "List jobs".to_string(),
            ToolKind::CronDelete => "Delete job".to_string(),
            ToolKind::Sum => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(default)]
                    numbers: Vec<f64>,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if input.numbers.is_empty() {
                    "Calculate sum".to_string()
                } else {
                    let parts: Vec<String> =
                        input.numbers.iter().map(|n| n.to_string()).collect();
                    format!("Sum: {}", parts.join(" + "))
                }
            }
            ToolKind::ExecuteCommand { .. } => {
                #[derive(Deserialize, Default)]
                struct In {
                    #[serde(default)]
                    command: String,
                }
                let input: In = serde_json::from_str(args).unwrap_or_default();
                if input.command.is_empty() {
                    "SSH command".to_string()
                } else {
                    format!("$ {}", input.command)
                }
            }
        }
    }
}

fn artifact_id_label(args: &str, verb: &str) -> String {
    #[derive(Deserialize, Default)]
    struct In {
        #[serde(rename = "artifactId", default)]
        artifact_id: String,
    }
    let input: In = serde_json::from_str(args).unwrap_or_default();
    if input.artifact_id.is_empty() {
        match verb {
            "Read" => "Read artifact".to_string(),
            "Transcribe" => "Transcribe audio".to_string(),
            "Describe" => "Describe image".to_string(),
            _ => "OCR image".to_string(),
        }
    } else {
        format!("{verb}: {}", truncate_chars(&input.artifact_id, 8))
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Late-binding metadata a tool publishes while it runs (session-log id,
/// model name). The loop polls this and forwards it as a `tool_meta` event.
#[derive(Debug, Clone, Default)]
pub struct ToolMeta {
    pub log_id: String,
    pub model_name: String,
}

/// Writeable slot for [`ToolMeta`], shared between a running tool and the
/// loop's poller.
#[derive(Debug, Clone, Default)]
pub struct ToolMetaSlot(Arc<Mutex<ToolMeta>>);

impl ToolMetaSlot {
    pub fn set_log_id(&self, log_id: impl Into<String>) {
        self.0.lock().unwrap().log_id = log_id.into();
    }

    pub fn set_model_name(&self, name: impl Into<String>) {
        self.0.lock().unwrap().model_name = name.into();
    }

    pub fn get(&self) -> ToolMeta {
        self.0.lock().unwrap().clone()
    }
}

/// Cross-component context bag threaded into every tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub step_id: String,
    pub message_id: String,
    pub meta: ToolMetaSlot,
    /// Cancelled when the request that spawned this tool is cancelled.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Executes tools by identity. Implementations own the runtime state tools
/// need (stores, artifact store, SSH sub-agent, media adapters).
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Runs one tool call. Errors become the tool's result text upstream, so
    /// the loop can recover.
    async fn dispatch(
        &self,
        ctx: ToolContext,
        kind: ToolKind,
        args: String,
    ) -> Result<String, MantisError>;
}
