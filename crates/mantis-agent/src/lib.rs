// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The agentic execution subsystem: agent loop, orchestrator, SSH sub-agent,
//! request pipeline, session logging, and the supporting policies.

pub mod agent_loop;
pub mod buffer;
pub mod history;
pub mod mantis;
pub mod messages;
pub mod model;
pub mod pipeline;
pub mod resolve;
pub mod session;
pub mod session_logger;
pub mod ssh;
pub mod ssh_files;

pub use agent_loop::{AgentLoop, LoopInput};
pub use buffer::{Buffer, BufferEntry};
pub use history::build_history;
pub use mantis::{sanitize_name, MantisAgent, MantisInput, ScheduleValidator};
pub use messages::ListMessages;
pub use model::{ModelQuery, ModelResolver, ModelSource, ResolvedModel};
pub use pipeline::{
    Finally, MemoryExtractor, PipelineInput, PipelineResult, RequestPipeline, SshStep, Workflow,
    WorkflowInput, WorkflowOutput,
};
pub use resolve::{resolve_connection, resolve_model};
pub use session::{SessionMode, SessionOutcome, SessionPolicy};
pub use session_logger::SessionLogger;
pub use ssh::{SshAgent, SshInput};
