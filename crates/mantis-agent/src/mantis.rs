// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator agent.
//!
//! Builds the system prompt and tool catalogue for a turn, then drives the
//! agent loop. SSH tools delegate to the per-host sub-agent; artifact, cron
//! and media tools execute in-process against the shared stores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mantis_artifact::{inline_preview, ArtifactStore};
use mantis_core::traits::llm::{ChatStreamer, LlmMessage};
use mantis_core::types::{
    ChatMessage, Config, Connection, CronJob, ListQuery, LlmConnection, Model, SshConfig,
};
use mantis_core::{
    stream::collect_text, Asr, EventStream, MantisError, Ocr, Store, ToolContext, ToolDispatcher,
    ToolKind, ToolSpec, VisionLlm,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_loop::{AgentLoop, LoopInput};
use crate::history::build_history;
use crate::resolve::{resolve_connection, resolve_model};
use crate::ssh::{SshAgent, SshInput};
use crate::ssh_files::{download_file, upload_file};

const MANTIS_BASE_PROMPT: &str = r#"You are Mantis, a helpful AI assistant that manages remote servers and tools on behalf of the user. Your job is to understand what the user needs, take action quickly, and report back concisely.

Personality:
- Be maximally concise. No filler, no preamble, no "Sure!", no "Great question!". Get straight to the point.
- Be proactive: if you notice something off (errors, warnings, resource issues) while executing a task, flag it without being asked.
- If a request is ambiguous, make your best guess and act — but mention your assumption in one short line so the user can correct you.
- If something fails, explain what went wrong and suggest a fix or next step. Never just say "an error occurred".
- When reporting results, highlight what matters: the answer, the change made, the key numbers. Skip noise.
- Match the user's tone and language. If they write casually, respond casually. If they write in Russian, respond in Russian.

Execution:
- All server actions go through tool calls. Never write shell commands in text instead of calling a tool.
- When calling ssh_* tools, describe the task in plain language (goal + expected result). The SSH agent picks the commands. You are the manager, not the executor.
- Before a tool call, give a one-line heads-up (what and why). After, report the outcome in 1-3 sentences.
- If the task needs multiple steps, chain them without asking for permission at each step. Report the full result at the end.
- NEVER make up factual data (prices, stats, versions, dates, IPs, etc.). If you are not 100% certain, use a tool to check. When the user asks for real-time or factual information, ALWAYS verify via a tool call — even if you just answered a similar question. Your training data is outdated; the only reliable source is a live check.
- If the user's request can be answered purely from general knowledge (concepts, explanations, how-tos) without factual lookups, answer directly.
- You have long-term memory about the user and their servers. Use this knowledge naturally — as if you simply remember it. Never say "according to my notes", "from your profile", "based on stored data", or anything that reveals the memory mechanism.

Tools:

ssh_<server_name> — run a task on a server via SSH agent.
  Parameter task: plain-language description of what to do and what result you expect.
  FORBIDDEN: shell commands, code, or flags in the task parameter.

ssh_download_<server_name> — download a file from the server into a temporary artifact.
  Parameter remotePath: file path on the server.

ssh_upload_<server_name> — upload a temporary artifact to the server.
  Parameters: artifactId, remotePath.

artifacts_list — list temporary in-memory artifacts.

artifact_read_text — preview a text artifact (avoids pulling large files into context).
  Parameter artifactId.

artifact_send_to_chat — queue an artifact for delivery to the user.
  Parameter artifactId.

artifact_transcribe — speech-to-text on an audio artifact.
  Parameter artifactId.

artifact_ocr — OCR on an image artifact.
  Parameter artifactId.

artifact_describe — describe an image artifact with the vision model.
  Parameter artifactId.

cron_create — create a scheduled job (cron expression + prompt).
  Parameters: schedule, prompt, name (optional).
  The prompt should describe ONLY the task (e.g. "Get the current BTC/USD price"). Delivery channel and recipient are configured globally in settings — never include them in the prompt.

cron_list — list scheduled jobs.

cron_delete — delete a scheduled job by id.

All artifacts are temporary (~30 min TTL, in-memory).

Formatting:
- If reply channel = telegram, use Telegram MarkdownV2.
- If reply channel = web, use Markdown (CommonMark + GFM).
- Otherwise, plain text.

Telegram MarkdownV2:
- bold: *text*, italic: _text_, underline: __text__, strikethrough: ~text~, spoiler: ||text||
- monospace: `code`, code block: ```
code
```
- Escape _ * [ ] ( ) ~ ` > # + - = | { } . ! with backslash for literal use.
- Lists: use "•" or "—" instead of "-" or "1.".
- When in doubt, plain text.
- Never insert raw file bytes."#;

const ORCHESTRATOR_MAX_ITERATIONS: usize = 30;

/// Validates a cron schedule; implemented by the scheduler crate and injected
/// here so `cron_create` uses the same parser the scheduler does.
pub type ScheduleValidator = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// One orchestrated turn.
pub struct MantisInput {
    pub session_id: String,
    pub model_id: String,
    pub content: String,
    pub artifacts: Arc<ArtifactStore>,
    /// Per-request id, normally the pending assistant message id.
    pub request_id: String,
    pub source: String,
    pub reply_channel: String,
    pub reply_to: String,
    pub disable_history: bool,
    pub cancel: CancellationToken,
}

struct Shared {
    message_store: Arc<dyn Store<ChatMessage>>,
    model_store: Arc<dyn Store<Model>>,
    llm_conn_store: Arc<dyn Store<LlmConnection>>,
    connection_store: Arc<dyn Store<Connection>>,
    cron_job_store: Arc<dyn Store<CronJob>>,
    config_store: Arc<dyn Store<Config>>,
    ssh_agent: SshAgent,
    asr: Option<Arc<dyn Asr>>,
    ocr: Option<Arc<dyn Ocr>>,
    vision: Option<Arc<dyn VisionLlm>>,
    schedule_validator: ScheduleValidator,
}

/// The orchestrator.
pub struct MantisAgent {
    shared: Arc<Shared>,
    agent_loop: AgentLoop,
}

impl MantisAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_store: Arc<dyn Store<ChatMessage>>,
        model_store: Arc<dyn Store<Model>>,
        llm_conn_store: Arc<dyn Store<LlmConnection>>,
        connection_store: Arc<dyn Store<Connection>>,
        cron_job_store: Arc<dyn Store<CronJob>>,
        config_store: Arc<dyn Store<Config>>,
        llm: Arc<dyn ChatStreamer>,
        ssh_agent: SshAgent,
        asr: Option<Arc<dyn Asr>>,
        ocr: Option<Arc<dyn Ocr>>,
        vision: Option<Arc<dyn VisionLlm>>,
        schedule_validator: ScheduleValidator,
    ) -> Self {
        MantisAgent {
            shared: Arc::new(Shared {
                message_store,
                model_store,
                llm_conn_store,
                connection_store,
                cron_job_store,
                config_store,
                ssh_agent,
                asr,
                ocr,
                vision,
                schedule_validator,
            }),
            agent_loop: AgentLoop::new(llm),
        }
    }

    /// Starts one turn and returns its event stream.
    pub async fn execute(&self, input: MantisInput) -> Result<EventStream, MantisError> {
        let model = resolve_model(self.shared.model_store.as_ref(), &input.model_id).await?;
        let llm_conn =
            resolve_connection(self.shared.llm_conn_store.as_ref(), &model.connection_id).await?;

        let history = if input.disable_history {
            Vec::new()
        } else {
            build_history(self.shared.message_store.as_ref(), &input.session_id).await?
        };

        let connections = self
            .shared
            .connection_store
            .list(ListQuery::default())
            .await?;

        let request_id = if input.request_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            input.request_id.trim().to_string()
        };

        let tools = build_tools(&connections);
        let prompt = self
            .build_system_prompt(
                &connections,
                &input.artifacts,
                &input.source,
                &input.reply_channel,
                &input.reply_to,
            )
            .await;

        let mut messages = vec![LlmMessage::new("system", prompt)];
        messages.extend(history);
        if input.disable_history {
            messages.push(LlmMessage::new("user", input.content.clone()));
        }

        let dispatcher = Arc::new(RequestDispatcher {
            shared: self.shared.clone(),
            artifacts: input.artifacts.clone(),
            request_id: request_id.clone(),
            llm_base_url: llm_conn.base_url.clone(),
            llm_api_key: llm_conn.api_key.clone(),
            llm_model: model.name.clone(),
        });

        Ok(self.agent_loop.execute(LoopInput {
            base_url: llm_conn.base_url,
            api_key: llm_conn.api_key,
            model: model.name,
            messages,
            tools,
            dispatcher,
            thinking_mode: model.thinking_mode,
            max_iterations: ORCHESTRATOR_MAX_ITERATIONS,
            message_id: request_id,
            cancel: input.cancel,
        }))
    }

    async fn load_user_memories(&self) -> Vec<String> {
        let Ok(found) = self.shared.config_store.get(&["default".to_string()]).await else {
            return Vec::new();
        };
        let Some(config) = found.get("default") else {
            return Vec::new();
        };
        if config.data.get("memoryEnabled").and_then(|v| v.as_bool()) != Some(true) {
            return Vec::new();
        }
        config
            .data
            .get("userMemories")
            .and_then(|v| v.as_array())
            .map(|facts| {
                facts
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn build_system_prompt(
        &self,
        connections: &[Connection],
        artifacts: &ArtifactStore,
        source: &str,
        reply_channel: &str,
        reply_to: &str,
    ) -> String {
        let mut prompt = String::from(MANTIS_BASE_PROMPT);
        prompt.push_str(&format!(
            "\n\nCurrent date/time: {}",
            Utc::now().format("%A, %Y-%m-%d %H:%M:%S UTC")
        ));

        let user_memories = self.load_user_memories().await;
        if !user_memories.is_empty() {
            prompt.push_str(
                "\n\nYou know the following about the user (use naturally, never mention where this knowledge comes from):",
            );
            for fact in &user_memories {
                prompt.push_str(&format!("\n- {fact}"));
            }
        }

        if !source.is_empty() || !reply_channel.is_empty() || !reply_to.is_empty() {
            prompt.push_str("\n\nRequest context:");
            if !source.is_empty() {
                prompt.push_str(&format!("\n- source: {source}"));
            }
            if !reply_channel.is_empty() {
                prompt.push_str(&format!("\n- reply channel: {reply_channel}"));
            }
            if !reply_to.is_empty() {
                prompt.push_str(&format!("\n- recipient: {reply_to}"));
            }
        }

        let attached = artifacts.list();
        if !attached.is_empty() {
            prompt.push_str("\n\nAvailable temporary artifacts (TTL ~30 min):");
            let shown = attached.len().min(20);
            for meta in &attached[..shown] {
                let mime = if meta.mime.is_empty() { "unknown" } else { &meta.mime };
                let format = if meta.format.is_empty() {
                    "unknown"
                } else {
                    &meta.format
                };
                prompt.push_str(&format!(
                    "\n- {} (artifact_id={}, format={format}, mime={mime}, size={} bytes, sha256={})",
                    meta.name, meta.id, meta.size_bytes, meta.sha256
                ));
            }
            if attached.len() > shown {
                prompt.push_str(&format!("\n...and {} more", attached.len() - shown));
            }
            prompt.push_str(
                "\nUse artifacts_list to see all artifacts and artifact_read_text to inspect contents.",
            );
        }

        if !connections.is_empty() {
            prompt.push_str("\n\nAvailable agents:\n");
            for connection in connections {
                prompt.push_str(&format!(
                    "\n- {} ({}): {}",
                    connection.name, connection.kind, connection.description
                ));
                if !connection.memories.is_empty() {
                    prompt.push_str("\n  Notes:");
                    for memory in &connection.memories {
                        prompt.push_str(&format!("\n  - {}", memory.content));
                    }
                }
            }
        }

        prompt
    }
}

/// Lower-cases and underscores a connection name for use in tool names.
pub fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' || c == '.' { '_' } else { c })
        .collect()
}

fn build_tools(connections: &[Connection]) -> Vec<ToolSpec> {
    let mut tools = Vec::new();
    for connection in connections {
        if connection.kind == "ssh" {
            let slug = sanitize_name(&connection.name);
            tools.push(ToolSpec {
                name: format!("ssh_{slug}"),
                description: format!(
                    "Execute tasks on {} via SSH. {}",
                    connection.name, connection.description
                ),
                icon: "terminal",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "task": {
                            "type": "string",
                            "description": format!("Task to execute on {}", connection.name),
                        },
                    },
                    "required": ["task"],
                }),
                kind: ToolKind::SshTask {
                    connection: connection.clone(),
                },
            });
            tools.push(ToolSpec {
                name: format!("ssh_download_{slug}"),
                description: format!(
                    "Download a remote file from {} via SSH into a temporary artifact (available only during this request).",
                    connection.name
                ),
                icon: "download",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "remotePath": {
                            "type": "string",
                            "description": "Absolute or relative path to the remote file to download",
                        },
                        "name": {
                            "type": "string",
                            "description": "Optional artifact display name (defaults to the remote file base name)",
                        },
                    },
                    "required": ["remotePath"],
                }),
                kind: ToolKind::SshDownload {
                    connection: connection.clone(),
                },
            });
            tools.push(ToolSpec {
                name: format!("ssh_upload_{slug}"),
                description: format!("Upload a temporary artifact to {} via SSH (SFTP).", connection.name),
                icon: "download",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "artifactId": {
                            "type": "string",
                            "description": "ID of the artifact to upload (from artifacts_list or ssh_download_*)",
                        },
                        "remotePath": {
                            "type": "string",
                            "description": "Destination file path on the remote server",
                        },
                        "overwrite": {
                            "type": "boolean",
                            "description": "Whether to overwrite the destination file (default: true)",
                        },
                        "mode": {
                            "type": "string",
                            "description": "Optional octal permissions, e.g. 0644",
                        },
                    },
                    "required": ["artifactId", "remotePath"],
                }),
                kind: ToolKind::SshUpload {
                    connection: connection.clone(),
                },
            });
        }
    }

    tools.push(ToolSpec {
        name: "artifacts_list".into(),
        description: "List temporary file artifacts available during this request.".into(),
        icon: "download",
        parameters: json!({"type": "object", "properties": {}}),
        kind: ToolKind::ArtifactsList,
    });
    tools.push(ToolSpec {
        name: "artifact_read_text".into(),
        description: "Read a small preview of a temporary artifact as text (for inspection only)."
            .into(),
        icon: "eye",
        parameters: json!({
            "type": "object",
            "properties": {
                "artifactId": {
                    "type": "string",
                    "description": "Artifact ID (from artifacts_list)",
                },
                "maxBytes": {
                    "type": "integer",
                    "description": "Maximum bytes to preview (default: 8192)",
                },
            },
            "required": ["artifactId"],
        }),
        kind: ToolKind::ArtifactReadText,
    });
    tools.push(ToolSpec {
        name: "artifact_send_to_chat".into(),
        description:
            "Mark an artifact for delivery to the requester (if the channel supports sending files)."
                .into(),
        icon: "download",
        parameters: json!({
            "type": "object",
            "properties": {
                "artifactId": {
                    "type": "string",
                    "description": "Artifact ID to send",
                },
                "fileName": {
                    "type": "string",
                    "description": "Optional file name for delivery (defaults to artifact name)",
                },
                "caption": {
                    "type": "string",
                    "description": "Optional caption",
                },
            },
            "required": ["artifactId"],
        }),
        kind: ToolKind::ArtifactSendToChat,
    });
    tools.push(ToolSpec {
        name: "artifact_transcribe".into(),
        description: "Transcribe an audio artifact to text (speech-to-text).".into(),
        icon: "mic",
        parameters: json!({
            "type": "object",
            "properties": {
                "artifactId": {
                    "type": "string",
                    "description": "Artifact ID of the audio file (from artifacts_list)",
                },
            },
            "required": ["artifactId"],
        }),
        kind: ToolKind::ArtifactTranscribe,
    });
    tools.push(ToolSpec {
        name: "artifact_ocr".into(),
        description: "Extract text from an image artifact (OCR).".into(),
        icon: "eye",
        parameters: json!({
            "type": "object",
            "properties": {
                "artifactId": {
                    "type": "string",
                    "description": "Artifact ID of the image file (from artifacts_list)",
                },
            },
            "required": ["artifactId"],
        }),
        kind: ToolKind::ArtifactOcr,
    });
    tools.push(ToolSpec {
        name: "artifact_describe".into(),
        description: "Describe an image artifact with the vision model (contents, layout, notable details)."
            .into(),
        icon: "eye",
        parameters: json!({
            "type": "object",
            "properties": {
                "artifactId": {
                    "type": "string",
                    "description": "Artifact ID of the image file (from artifacts_list)",
                },
                "prompt": {
                    "type": "string",
                    "description": "Optional question to answer about the image",
                },
            },
            "required": ["artifactId"],
        }),
        kind: ToolKind::ArtifactDescribe,
    });
    tools.push(ToolSpec {
        name: "cron_create".into(),
        description:
            "Create a cron job (schedule + prompt). Schedule: 5 fields (min hour day month weekday), supports @every."
                .into(),
        icon: "clock",
        parameters: json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Job name (optional)"},
                "schedule": {
                    "type": "string",
                    "description": "Cron schedule (min hour day month weekday) or @every",
                },
                "prompt": {
                    "type": "string",
                    "description": "Task to execute on schedule (just the task, no recipient/channel info)",
                },
                "enabled": {
                    "type": "boolean",
                    "description": "Whether the job is enabled (default true)",
                },
            },
            "required": ["schedule", "prompt"],
        }),
        kind: ToolKind::CronCreate,
    });
    tools.push(ToolSpec {
        name: "cron_list".into(),
        description: "List all cron jobs.".into(),
        icon: "clock",
        parameters: json!({"type": "object", "properties": {}}),
        kind: ToolKind::CronList,
    });
    tools.push(ToolSpec {
        name: "cron_delete".into(),
        description: "Delete a cron job by id.".into(),
        icon: "clock",
        parameters: json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Cron job ID"},
            },
            "required": ["id"],
        }),
        kind: ToolKind::CronDelete,
    });
    tools.push(ToolSpec {
        name: "sum".into(),
        description: "Calculate the sum of a list of numbers".into(),
        icon: "calculator",
        parameters: json!({
            "type": "object",
            "properties": {
                "numbers": {
                    "type": "array",
                    "items": {"type": "number"},
                },
            },
            "required": ["numbers"],
        }),
        kind: ToolKind::Sum,
    });
    tools
}

/// Per-request tool executor: shared services plus this request's artifact
/// store and id.
struct RequestDispatcher {
    shared: Arc<Shared>,
    artifacts: Arc<ArtifactStore>,
    request_id: String,
    // The turn's LLM endpoint, reused by the vision tool.
    llm_base_url: String,
    llm_api_key: String,
    llm_model: String,
}

#[async_trait]
impl ToolDispatcher for RequestDispatcher {
    async fn dispatch(
        &self,
        ctx: ToolContext,
        kind: ToolKind,
        args: String,
    ) -> Result<String, MantisError> {
        match kind {
            ToolKind::SshTask { connection } => self.ssh_task(ctx, connection, &args).await,
            ToolKind::SshDownload { connection } => self.ssh_download(connection, &args).await,
            ToolKind::SshUpload { connection } => self.ssh_upload(connection, &args).await,
            ToolKind::ArtifactsList => self.artifacts_list(),
            ToolKind::ArtifactReadText => self.artifact_read_text(&args),
            ToolKind::ArtifactSendToChat => self.artifact_send_to_chat(&args),
            ToolKind::ArtifactTranscribe => self.artifact_transcribe(&args).await,
            ToolKind::ArtifactOcr => self.artifact_ocr(&args).await,
            ToolKind::ArtifactDescribe => self.artifact_describe(&args).await,
            ToolKind::CronCreate => self.cron_create(&args).await,
            ToolKind::CronList => self.cron_list().await,
            ToolKind::CronDelete => self.cron_delete(&args).await,
            ToolKind::Sum => sum(&args),
            ToolKind::ExecuteCommand { .. } => Err(MantisError::Internal(
                "execute_command is only available inside the SSH sub-agent".into(),
            )),
        }
    }
}

impl RequestDispatcher {
    async fn ssh_task(
        &self,
        ctx: ToolContext,
        connection: Connection,
        args: &str,
    ) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            task: String,
        }
        let input: In = serde_json::from_str(args)?;

        let model = resolve_model(self.shared.model_store.as_ref(), &connection.model_id)
            .await
            .map_err(|e| MantisError::Validation(format!("agent {}: {e}", connection.name)))?;
        ctx.meta.set_model_name(model.name.clone());

        let ssh_config: SshConfig =
            serde_json::from_value(connection.config.clone()).unwrap_or_default();
        let cancel = ctx.cancel.clone();
        let stream = self
            .shared
            .ssh_agent
            .execute(
                &ctx,
                SshInput {
                    model,
                    config: ssh_config,
                    connection,
                    task: input.task,
                    cancel,
                },
            )
            .await?;
        collect_text(stream).await
    }

    async fn ssh_download(
        &self,
        connection: Connection,
        args: &str,
    ) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "remotePath")]
            remote_path: String,
            #[serde(default)]
            name: String,
        }
        let input: In = serde_json::from_str(args)?;

        let ssh_config: SshConfig =
            serde_json::from_value(connection.config.clone()).unwrap_or_default();
        let max_bytes = self.artifacts.max_file_bytes;
        let remote_path = input.remote_path.clone();
        let data = tokio::task::spawn_blocking(move || {
            download_file(&ssh_config, &remote_path, max_bytes)
        })
        .await
        .map_err(|e| MantisError::Internal(format!("sftp task failed: {e}")))??;

        let name = if input.name.is_empty() {
            input
                .remote_path
                .rsplit('/')
                .next()
                .unwrap_or("download")
                .to_string()
        } else {
            input.name
        };
        let meta = self.artifacts.put(&name, data, "")?;
        Ok(json!({
            "artifact_id": meta.id,
            "name": meta.name,
            "format": meta.format,
            "size_bytes": meta.size_bytes,
            "sha256": meta.sha256,
        })
        .to_string())
    }

    async fn ssh_upload(&self, connection: Connection, args: &str) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
            #[serde(rename = "remotePath")]
            remote_path: String,
            overwrite: Option<bool>,
            #[serde(default)]
            mode: String,
        }
        let input: In = serde_json::from_str(args)?;

        let artifact = self
            .artifacts
            .get(&input.artifact_id)
            .ok_or_else(|| MantisError::NotFound(format!("unknown artifact_id: {}", input.artifact_id)))?;

        let mode = if input.mode.is_empty() {
            None
        } else {
            Some(u32::from_str_radix(&input.mode, 8).map_err(|e| {
                MantisError::Validation(format!("invalid mode {:?}: {e}", input.mode))
            })?)
        };
        let overwrite = input.overwrite.unwrap_or(true);

        let ssh_config: SshConfig =
            serde_json::from_value(connection.config.clone()).unwrap_or_default();
        let remote_path = input.remote_path.clone();
        tokio::task::spawn_blocking(move || {
            upload_file(&ssh_config, &remote_path, &artifact.bytes, mode, overwrite)
        })
        .await
        .map_err(|e| MantisError::Internal(format!("sftp task failed: {e}")))??;

        Ok(json!({
            "ok": true,
            "artifact_id": input.artifact_id,
            "remote_path": input.remote_path,
        })
        .to_string())
    }

    fn artifacts_list(&self) -> Result<String, MantisError> {
        Ok(json!({
            "artifacts": self.artifacts.list(),
            "outgoing": self.artifacts.outgoing(&self.request_id),
        })
        .to_string())
    }

    fn artifact_read_text(&self, args: &str) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
            #[serde(rename = "maxBytes", default)]
            max_bytes: usize,
        }
        let input: In = serde_json::from_str(args)?;
        let artifact = self
            .artifacts
            .get(&input.artifact_id)
            .ok_or_else(|| MantisError::NotFound(format!("unknown artifact_id: {}", input.artifact_id)))?;

        let preview = inline_preview(&artifact, input.max_bytes);
        let format = if artifact.format.is_empty() {
            "unknown"
        } else {
            &artifact.format
        };
        let mime = if artifact.mime.is_empty() {
            "unknown"
        } else {
            &artifact.mime
        };
        let header = format!(
            "File: {} (format={format}, mime={mime}, {} bytes, sha256={})",
            artifact.name, artifact.size_bytes, artifact.sha256
        );
        if preview.is_empty() {
            Ok(header)
        } else {
            Ok(format!("{header}\n\n{preview}"))
        }
    }

    fn artifact_send_to_chat(&self, args: &str) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
            #[serde(rename = "fileName", default)]
            file_name: String,
            #[serde(default)]
            caption: String,
        }
        let input: In = serde_json::from_str(args)?;
        let file_name = if input.file_name.is_empty() {
            self.artifacts
                .get(&input.artifact_id)
                .map(|a| a.name)
                .unwrap_or_default()
        } else {
            input.file_name
        };
        self.artifacts
            .mark_to_send(&self.request_id, &input.artifact_id, &file_name, &input.caption)?;
        Ok(json!({
            "ok": true,
            "request_id": self.request_id,
            "artifact_id": input.artifact_id,
            "file_name": file_name,
            "note": "queued for delivery (channel-dependent)",
        })
        .to_string())
    }

    async fn artifact_transcribe(&self, args: &str) -> Result<String, MantisError> {
        let asr = self
            .shared
            .asr
            .as_ref()
            .ok_or_else(|| MantisError::Validation("ASR is not configured".into()))?;
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
        }
        let input: In = serde_json::from_str(args)?;
        let artifact = self
            .artifacts
            .get(&input.artifact_id)
            .ok_or_else(|| MantisError::NotFound(format!("unknown artifact_id: {}", input.artifact_id)))?;

        let format = media_format(&artifact.format, &artifact.mime, "audio/", "ogg");
        let text = asr.transcribe(&artifact.bytes, &format).await?;
        Ok(text.trim().to_string())
    }

    async fn artifact_ocr(&self, args: &str) -> Result<String, MantisError> {
        let ocr = self
            .shared
            .ocr
            .as_ref()
            .ok_or_else(|| MantisError::Validation("OCR is not configured".into()))?;
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
        }
        let input: In = serde_json::from_str(args)?;
        let artifact = self
            .artifacts
            .get(&input.artifact_id)
            .ok_or_else(|| MantisError::NotFound(format!("unknown artifact_id: {}", input.artifact_id)))?;

        let format = media_format(&artifact.format, &artifact.mime, "image/", "png");
        let text = ocr.extract_text(&artifact.bytes, &format).await?;
        Ok(text.trim().to_string())
    }

    async fn artifact_describe(&self, args: &str) -> Result<String, MantisError> {
        let vision = self
            .shared
            .vision
            .as_ref()
            .ok_or_else(|| MantisError::Validation("vision is not configured".into()))?;
        #[derive(Deserialize)]
        struct In {
            #[serde(rename = "artifactId")]
            artifact_id: String,
            #[serde(default)]
            prompt: String,
        }
        let input: In = serde_json::from_str(args)?;
        let artifact = self
            .artifacts
            .get(&input.artifact_id)
            .ok_or_else(|| MantisError::NotFound(format!("unknown artifact_id: {}", input.artifact_id)))?;

        let format = media_format(&artifact.format, &artifact.mime, "image/", "png");
        let prompt = if input.prompt.is_empty() {
            "Describe this image in detail.".to_string()
        } else {
            input.prompt
        };
        let text = vision
            .describe(
                &self.llm_base_url,
                &self.llm_api_key,
                &self.llm_model,
                &artifact.bytes,
                &format,
                &prompt,
            )
            .await?;
        Ok(format!("<file_content>\n{}\n</file_content>", text.trim()))
    }

    async fn cron_create(&self, args: &str) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(default)]
            name: String,
            #[serde(default)]
            schedule: String,
            #[serde(default)]
            prompt: String,
            enabled: Option<bool>,
        }
        let input: In = serde_json::from_str(args)?;
        if input.schedule.trim().is_empty() {
            return Err(MantisError::Validation("schedule is required".into()));
        }
        if input.prompt.trim().is_empty() {
            return Err(MantisError::Validation("prompt is required".into()));
        }
        (self.shared.schedule_validator)(&input.schedule).map_err(|e| {
            MantisError::Validation(format!("invalid cron schedule {:?}: {e}", input.schedule))
        })?;

        let name = if input.name.trim().is_empty() {
            "Cron job".to_string()
        } else {
            input.name.trim().to_string()
        };
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name,
            schedule: input.schedule,
            prompt: input.prompt,
            enabled: input.enabled.unwrap_or(true),
        };
        let created = self.shared.cron_job_store.create(vec![job]).await?;
        Ok(serde_json::to_string(&created[0])?)
    }

    async fn cron_list(&self) -> Result<String, MantisError> {
        let jobs = self
            .shared
            .cron_job_store
            .list(ListQuery::default())
            .await?;
        Ok(json!({ "jobs": jobs }).to_string())
    }

    async fn cron_delete(&self, args: &str) -> Result<String, MantisError> {
        #[derive(Deserialize)]
        struct In {
            #[serde(default)]
            id: String,
        }
        let input: In = serde_json::from_str(args)?;
        if input.id.trim().is_empty() {
            return Err(MantisError::Validation("id is required".into()));
        }
        self.shared.cron_job_store.delete(&[input.id.clone()]).await?;
        Ok(json!({"ok": true, "id": input.id}).to_string())
    }
}

fn media_format(format: &str, mime: &str, mime_prefix: &str, fallback: &str) -> String {
    if !format.is_empty() {
        return format.to_string();
    }
    let from_mime = mime.strip_prefix(mime_prefix).unwrap_or("");
    if !from_mime.is_empty() {
        return from_mime.to_string();
    }
    fallback.to_string()
}

fn sum(args: &str) -> Result<String, MantisError> {
    #[derive(Deserialize)]
    struct In {
        numbers: Vec<f64>,
    }
    let input: In = serde_json::from_str(args)?;
    let total: f64 = input.numbers.iter().sum();
    Ok(total.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_produces_slugs() {
        assert_eq!(sanitize_name("Web Server-1.prod"), "web_server_1_prod");
    }

    #[test]
    fn tool_catalogue_covers_every_connection() {
        let connections = vec![
            Connection {
                id: "c1".into(),
                kind: "ssh".into(),
                name: "web-1".into(),
                ..Default::default()
            },
            Connection {
                id: "c2".into(),
                kind: "other".into(),
                name: "ignored".into(),
                ..Default::default()
            },
        ];
        let tools = build_tools(&connections);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"ssh_web_1"));
        assert!(names.contains(&"ssh_download_web_1"));
        assert!(names.contains(&"ssh_upload_web_1"));
        assert!(!names.iter().any(|n| n.contains("ignored")));
        for fixed in [
            "artifacts_list",
            "artifact_read_text",
            "artifact_send_to_chat",
            "artifact_transcribe",
            "artifact_ocr",
            "artifact_describe",
            "cron_create",
            "cron_list",
            "cron_delete",
            "sum",
        ] {
            assert!(names.contains(&fixed), "missing {fixed}");
        }
    }

    #[test]
    fn sum_adds_numbers() {
        assert_eq!(sum(r#"{"numbers":[1,2,3.5]}"#).unwrap(), "6.5");
    }

    #[test]
    fn media_format_prefers_explicit_format() {
        assert_eq!(media_format("mp3", "audio/ogg", "audio/", "ogg"), "mp3");
        assert_eq!(media_format("", "audio/ogg", "audio/", "wav"), "ogg");
        assert_eq!(media_format("", "", "audio/", "ogg"), "ogg");
    }
}
