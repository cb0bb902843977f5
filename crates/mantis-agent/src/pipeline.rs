// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request pipeline: stream -> collect -> persist -> deliver -> extract
//! memory, plus the workflow that turns an inbound user message into the
//! persisted user/pending-assistant pair before handing off to the pipeline.
//!
//! Every failure path runs through message finalisation, so the user always
//! sees exactly one assistant message per turn: with normal content, or with
//! an error suffix and `status = "error"`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mantis_artifact::{ArtifactManager, ArtifactStore};
use mantis_core::traits::delivery::{DeliveryRequest, FileAttachment, ResponseTo};
use mantis_core::types::{ChatMessage, Model, Step};
use mantis_core::{EventKind, EventStream, MantisError, Store};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::mantis::{MantisAgent, MantisInput};
use crate::model::{ModelQuery, ModelResolver};
use crate::resolve::resolve_model;

/// A completed `ssh_*` step in a turn, as handed to the memory extractor.
#[derive(Debug, Clone)]
pub struct SshStep {
    pub tool_name: String,
    pub task: String,
    pub result: String,
}

/// Post-turn memory extraction hook. Runs detached from the request; its
/// failures are advisory only.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(
        &self,
        user_content: String,
        assistant_content: String,
        ssh_steps: Vec<SshStep>,
    );
}

/// Parameters of one pipeline run.
pub struct PipelineInput {
    /// The pending assistant stub already persisted by the workflow.
    pub message: ChatMessage,
    pub session_id: String,
    pub content: String,
    pub artifacts: Arc<ArtifactStore>,
    pub model_query: ModelQuery,
    pub response_to: Option<Arc<dyn ResponseTo>>,
    pub source: String,
    pub disable_history: bool,
    /// Defaults to "[Error]" when empty.
    pub error_prefix: String,
    /// Zero disables the per-request timeout.
    pub timeout: Duration,
    pub finally: Finally,
}

/// Outcome of one pipeline run.
pub struct PipelineResult {
    pub message: ChatMessage,
    pub outgoing: Vec<FileAttachment>,
    pub error: Option<MantisError>,
    pub send_error: Option<MantisError>,
}

/// Drop guard running a callback exactly once, on every exit path.
#[derive(Default)]
pub struct Finally(Option<Box<dyn FnOnce() + Send>>);

impl Finally {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Finally(Some(Box::new(callback)))
    }

    pub fn none() -> Self {
        Finally(None)
    }
}

impl Drop for Finally {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

/// The pipeline behind every channel.
pub struct RequestPipeline {
    agent: Arc<MantisAgent>,
    buffer: Arc<Buffer>,
    message_store: Arc<dyn Store<ChatMessage>>,
    model_store: Arc<dyn Store<Model>>,
    model_resolver: Arc<ModelResolver>,
    memory_extractor: Option<Arc<dyn MemoryExtractor>>,
}

impl RequestPipeline {
    pub fn new(
        agent: Arc<MantisAgent>,
        buffer: Arc<Buffer>,
        message_store: Arc<dyn Store<ChatMessage>>,
        model_store: Arc<dyn Store<Model>>,
        model_resolver: Arc<ModelResolver>,
        memory_extractor: Option<Arc<dyn MemoryExtractor>>,
    ) -> Self {
        RequestPipeline {
            agent,
            buffer,
            message_store,
            model_store,
            model_resolver,
            memory_extractor,
        }
    }

    pub async fn execute(&self, mut input: PipelineInput) -> PipelineResult {
        let _finally = std::mem::take(&mut input.finally);

        let cancel = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));
        if !input.timeout.is_zero() {
            let cancel = cancel.clone();
            let timed_out = timed_out.clone();
            let timeout = input.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            });
        }

        let resolved = match self.model_resolver.execute(input.model_query.clone()).await {
            Ok(resolved) => resolved,
            Err(err) => return self.fail(input, err).await,
        };
        let model_id = resolved.model_id.trim().to_string();
        if model_id.is_empty() {
            return self
                .fail(input, MantisError::Validation("model not configured".into()))
                .await;
        }

        if let Ok(model) = resolve_model(self.model_store.as_ref(), &model_id).await {
            input.message.model_name = model.name;
        }

        let (reply_channel, reply_to) = match &input.response_to {
            Some(sink) => (sink.channel().to_string(), sink.recipient().to_string()),
            None => (String::new(), String::new()),
        };

        let run = self
            .agent
            .execute(MantisInput {
                session_id: input.session_id.clone(),
                model_id,
                content: input.content.clone(),
                artifacts: input.artifacts.clone(),
                request_id: input.message.id.clone(),
                source: input.source.clone(),
                reply_channel,
                reply_to,
                disable_history: input.disable_history,
                cancel: cancel.clone(),
            })
            .await;

        let (content, steps, mut run_error) = match run {
            Ok(stream) => self.collect_stream(&input.message.id, stream).await,
            Err(err) => (String::new(), Vec::new(), Some(err)),
        };
        if timed_out.load(Ordering::SeqCst) {
            run_error = Some(MantisError::Timeout {
                duration: input.timeout,
            });
        }

        let message = finalize_message(
            input.message.clone(),
            content,
            &steps,
            run_error.as_ref(),
            &input.error_prefix,
        );
        self.save_message(&message).await;

        if let Some(extractor) = &self.memory_extractor {
            if message.status != "error" && !input.content.is_empty() && !message.content.is_empty()
            {
                let extractor = extractor.clone();
                let user_content = input.content.clone();
                let assistant_content = message.content.clone();
                let ssh_steps = collect_ssh_steps(&steps);
                tokio::spawn(async move {
                    extractor
                        .extract(user_content, assistant_content, ssh_steps)
                        .await;
                });
            }
        }

        let outgoing = collect_outgoing(&input.message.id, &input.artifacts);
        let send_error = self
            .send(&input.response_to, &message.content, steps, &outgoing)
            .await;

        self.buffer.delete(&input.message.id);

        PipelineResult {
            message,
            outgoing,
            error: run_error,
            send_error,
        }
    }

    async fn fail(&self, input: PipelineInput, err: MantisError) -> PipelineResult {
        let message = finalize_message(
            input.message.clone(),
            String::new(),
            &[],
            Some(&err),
            &input.error_prefix,
        );
        self.save_message(&message).await;
        let send_error = self
            .send(&input.response_to, &message.content, Vec::new(), &[])
            .await;
        self.buffer.delete(&input.message.id);
        PipelineResult {
            message,
            outgoing: Vec::new(),
            error: Some(err),
            send_error,
        }
    }

    /// Drains the stream while mirroring progress into the live buffer.
    /// Returns accumulated content, steps, and the first error event seen.
    async fn collect_stream(
        &self,
        request_id: &str,
        mut stream: EventStream,
    ) -> (String, Vec<Step>, Option<MantisError>) {
        let mut content = String::new();
        let mut steps: Vec<Step> = Vec::new();
        let mut step_index: std::collections::HashMap<String, usize> = Default::default();
        let mut error = None;

        while let Some(event) = stream.recv().await {
            match event.kind {
                EventKind::Error => {
                    // Remember the failure but keep draining so tool
                    // brackets close and the buffer stays consistent.
                    if error.is_none() {
                        error = Some(MantisError::llm(event.delta));
                    }
                }
                EventKind::Text => {
                    content.push_str(&event.delta);
                    self.buffer.set_content(request_id, content.clone());
                }
                EventKind::ToolStart => {
                    let mut step: Step =
                        serde_json::from_str(&event.delta).unwrap_or_default();
                    step.content_offset = content.len();
                    step_index.insert(step.id.clone(), steps.len());
                    self.buffer.set_step(request_id, step.clone());
                    steps.push(step);
                }
                EventKind::ToolMeta => {
                    if let Some(&idx) = step_index.get(&event.tool_id) {
                        steps[idx].log_id = event.log_id.clone();
                        steps[idx].model_name = event.model_name.clone();
                        self.buffer.set_step(request_id, steps[idx].clone());
                    }
                }
                EventKind::ToolEnd => {
                    if let Some(&idx) = step_index.get(&event.tool_id) {
                        steps[idx].status = "completed".into();
                        steps[idx].result = event.delta.clone();
                        if !event.log_id.is_empty() {
                            steps[idx].log_id = event.log_id.clone();
                        }
                        if !event.model_name.is_empty() {
                            steps[idx].model_name = event.model_name.clone();
                        }
                        steps[idx].finished_at =
                            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                        self.buffer.set_step(request_id, steps[idx].clone());
                    }
                }
                _ => {}
            }
        }

        (content, steps, error)
    }

    async fn save_message(&self, message: &ChatMessage) {
        if let Err(err) = self.message_store.update(vec![message.clone()]).await {
            error!(error = %err, message_id = message.id.as_str(), "pipeline: save message failed");
        }
    }

    async fn send(
        &self,
        sink: &Option<Arc<dyn ResponseTo>>,
        text: &str,
        steps: Vec<Step>,
        files: &[FileAttachment],
    ) -> Option<MantisError> {
        let sink = sink.as_ref()?;
        let result = sink
            .execute(DeliveryRequest {
                text: text.to_string(),
                steps,
                files: files.to_vec(),
            })
            .await;
        match result {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "pipeline: delivery failed");
                Some(err)
            }
        }
    }
}

fn finalize_message(
    mut message: ChatMessage,
    content: String,
    steps: &[Step],
    error: Option<&MantisError>,
    error_prefix: &str,
) -> ChatMessage {
    message.content = content;
    if !steps.is_empty() {
        message.steps = serde_json::to_value(steps).ok();
    }
    let Some(error) = error else {
        message.status = String::new();
        return message;
    };

    let prefix = error_prefix.trim();
    let prefix = if prefix.is_empty() { "[Error]" } else { prefix };
    let error_text = format!("{prefix} {error}");
    if message.content.is_empty() {
        message.content = error_text;
    } else {
        message.content.push_str("\n\n");
        message.content.push_str(&error_text);
    }
    message.status = "error".into();
    message
}

fn collect_outgoing(request_id: &str, artifacts: &ArtifactStore) -> Vec<FileAttachment> {
    let queued = artifacts.take_outgoing(request_id);
    let mut files = Vec::new();
    for item in queued {
        let Some(artifact) = artifacts.get(&item.artifact_id) else {
            continue;
        };
        if artifact.bytes.is_empty() {
            continue;
        }
        let mut file_name = item.file_name;
        if file_name.is_empty() {
            file_name = artifact.name.clone();
        }
        if file_name.is_empty() {
            file_name = "attachment".into();
        }
        files.push(FileAttachment {
            file_name,
            mime_type: artifact.mime.clone(),
            data: artifact.bytes,
            caption: item.caption,
        });
    }
    files
}

fn collect_ssh_steps(steps: &[Step]) -> Vec<SshStep> {
    steps
        .iter()
        .filter(|s| {
            s.tool.starts_with("ssh_")
                && !s.tool.starts_with("ssh_download_")
                && !s.tool.starts_with("ssh_upload_")
                && s.status == "completed"
                && !s.result.is_empty()
        })
        .map(|s| {
            #[derive(Deserialize, Default)]
            struct Args {
                #[serde(default)]
                task: String,
            }
            let args: Args = serde_json::from_str(&s.args).unwrap_or_default();
            SshStep {
                tool_name: s.tool.clone(),
                task: args.task,
                result: s.result.clone(),
            }
        })
        .collect()
}

/// Turns an inbound user message into the persisted user/pending-assistant
/// pair, then runs the pipeline on a detached task.
pub struct Workflow {
    pipeline: Arc<RequestPipeline>,
    message_store: Arc<dyn Store<ChatMessage>>,
    artifact_manager: Arc<ArtifactManager>,
}

/// Parameters of one workflow run.
pub struct WorkflowInput {
    pub session_id: String,
    pub content: String,
    pub incoming: Vec<FileAttachment>,
    pub model_query: ModelQuery,
    pub response_to: Option<Arc<dyn ResponseTo>>,
    pub source: String,
    pub disable_history: bool,
    pub error_prefix: String,
    pub timeout: Duration,
    pub finally: Finally,
}

/// The two persisted rows of the turn.
pub struct WorkflowOutput {
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
}

impl Workflow {
    pub fn new(
        pipeline: Arc<RequestPipeline>,
        message_store: Arc<dyn Store<ChatMessage>>,
        artifact_manager: Arc<ArtifactManager>,
    ) -> Self {
        Workflow {
            pipeline,
            message_store,
            artifact_manager,
        }
    }

    pub async fn execute(&self, mut input: WorkflowInput) -> Result<WorkflowOutput, MantisError> {
        // Runs when the pipeline finishes, or here if we bail out early.
        let finally = std::mem::take(&mut input.finally);

        let session_id = input.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(MantisError::Validation("session_id is required".into()));
        }

        let artifacts = self.artifact_manager.for_session(&session_id);
        for file in &input.incoming {
            if file.data.is_empty() {
                continue;
            }
            let name = if file.file_name.is_empty() {
                "attachment"
            } else {
                &file.file_name
            };
            if let Err(err) = artifacts.put(name, file.data.clone(), &file.mime_type) {
                warn!(error = %err, "workflow: dropping oversized attachment");
            }
        }

        let now = Utc::now();
        let user_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            role: "user".into(),
            content: input.content.clone(),
            source: input.source.clone(),
            created_at: now,
            ..Default::default()
        };
        let assistant_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            role: "assistant".into(),
            status: "pending".into(),
            source: input.source.clone(),
            created_at: now + chrono::Duration::milliseconds(1),
            ..Default::default()
        };
        self.message_store
            .create(vec![user_message.clone(), assistant_message.clone()])
            .await?;

        let pipeline = self.pipeline.clone();
        let pipeline_input = PipelineInput {
            message: assistant_message.clone(),
            session_id,
            content: std::mem::take(&mut input.content),
            artifacts,
            model_query: input.model_query,
            response_to: input.response_to,
            source: input.source,
            disable_history: input.disable_history,
            error_prefix: input.error_prefix,
            timeout: input.timeout,
            finally,
        };
        tokio::spawn(async move {
            pipeline.execute(pipeline_input).await;
        });

        Ok(WorkflowOutput {
            user_message,
            assistant_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(tool: &str, status: &str, args: &str, result: &str) -> Step {
        Step {
            id: Uuid::new_v4().to_string(),
            tool: tool.into(),
            status: status.into(),
            args: args.into(),
            result: result.into(),
            ..Default::default()
        }
    }

    #[test]
    fn collect_ssh_steps_filters_transfers_and_incomplete() {
        let steps = vec![
            step("ssh_web_1", "completed", r#"{"task":"check disk"}"#, "42G"),
            step("ssh_download_web_1", "completed", "{}", "ok"),
            step("ssh_upload_web_1", "completed", "{}", "ok"),
            step("ssh_web_1", "running", r#"{"task":"x"}"#, ""),
            step("sum", "completed", "{}", "2"),
        ];
        let ssh_steps = collect_ssh_steps(&steps);
        assert_eq!(ssh_steps.len(), 1);
        assert_eq!(ssh_steps[0].tool_name, "ssh_web_1");
        assert_eq!(ssh_steps[0].task, "check disk");
        assert_eq!(ssh_steps[0].result, "42G");
    }

    #[test]
    fn finalize_sets_error_suffix_and_status() {
        let base = ChatMessage {
            id: "m1".into(),
            ..Default::default()
        };

        let ok = finalize_message(base.clone(), "fine".into(), &[], None, "[Error]");
        assert_eq!(ok.status, "");
        assert_eq!(ok.content, "fine");

        let err = MantisError::llm("boom");
        let failed = finalize_message(base.clone(), "partial".into(), &[], Some(&err), "");
        assert_eq!(failed.status, "error");
        assert_eq!(failed.content, "partial\n\n[Error] llm error: boom");

        let empty = finalize_message(base, String::new(), &[], Some(&err), "[Cron]");
        assert_eq!(empty.content, "[Cron] llm error: boom");
    }

    #[test]
    fn finalize_serializes_steps() {
        let steps = vec![step("sum", "completed", "{}", "2")];
        let message = finalize_message(
            ChatMessage::default(),
            "x".into(),
            &steps,
            None,
            "[Error]",
        );
        let value = message.steps.unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["tool"], "sum");
    }
}
