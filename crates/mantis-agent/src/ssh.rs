// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-host SSH sub-agent.
//!
//! The sub-agent probes the host for an instruction README, builds a prompt
//! from the connection's description, memories and guard policy, and runs the
//! agent loop with a single `execute_command` tool. Guard violations are
//! returned as successful `[BLOCKED]` tool results so the model can adapt.
//!
//! All libssh2 work runs on the blocking pool. Host-key verification is
//! skipped: the trust boundary is the stored credentials.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mantis_core::traits::llm::{ChatStreamer, LlmMessage};
use mantis_core::types::{Connection, LlmConnection, Model, SshConfig};
use mantis_core::{
    EventStream, MantisError, Store, ToolContext, ToolDispatcher, ToolKind, ToolSpec,
};
use mantis_guard::Guard;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{AgentLoop, LoopInput};
use crate::resolve::resolve_connection;
use crate::session_logger::SessionLogger;

const SSH_BASE_PROMPT: &str = "You are an SSH agent. All actions go through execute_command tool calls only.

Rules:
- Be concise: short answers, no filler, keep full info. Verbose only if user asks.
- One command per call. Explain briefly before each call.
- Verify before acting (which, cat, ls).
- Summarize the result at the end.
- Plain text only, no Markdown/HTML.
- If a command is blocked, do not retry it — use an alternative or inform the user.

execute_command(command: string) — run a shell command on the remote server via SSH.";

const SSH_MAX_ITERATIONS: usize = 30;

/// Timeout for interactive sessions (probe, exec).
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tool output beyond this is cut with a TRUNCATED sentinel.
const MAX_OUTPUT_BYTES: usize = 32 * 1024;

/// Parameters of one sub-agent run.
pub struct SshInput {
    pub model: Model,
    pub config: SshConfig,
    pub connection: Connection,
    pub task: String,
    pub cancel: CancellationToken,
}

/// The per-host sub-agent.
pub struct SshAgent {
    llm_conn_store: Arc<dyn Store<LlmConnection>>,
    agent_loop: AgentLoop,
    guard: Arc<Guard>,
    session_logger: Arc<SessionLogger>,
}

impl SshAgent {
    pub fn new(
        llm_conn_store: Arc<dyn Store<LlmConnection>>,
        llm: Arc<dyn ChatStreamer>,
        guard: Arc<Guard>,
        session_logger: Arc<SessionLogger>,
    ) -> Self {
        SshAgent {
            llm_conn_store,
            agent_loop: AgentLoop::new(llm),
            guard,
            session_logger,
        }
    }

    /// Runs one task against a host. The returned stream is wrapped by the
    /// session logger, which also publishes the log id through `ctx`.
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        input: SshInput,
    ) -> Result<EventStream, MantisError> {
        let llm_conn = resolve_connection(
            self.llm_conn_store.as_ref(),
            &input.model.connection_id,
        )
        .await?;

        let host_readme = {
            let config = input.config.clone();
            tokio::task::spawn_blocking(move || probe_host(&config))
                .await
                .map_err(|e| MantisError::Internal(format!("probe task failed: {e}")))?
        }
        .map_err(|e| {
            MantisError::Ssh {
                message: format!(
                    "ssh probe {}:{}: {e}",
                    input.config.host,
                    effective_port(&input.config)
                ),
                source: None,
            }
        })?;

        let prompt = self
            .build_prompt(&input.connection, &host_readme)
            .await;

        let tools = vec![execute_command_tool(
            input.config.clone(),
            input.connection.profile_ids.clone(),
        )];

        let stream = self.agent_loop.execute(LoopInput {
            base_url: llm_conn.base_url,
            api_key: llm_conn.api_key,
            model: input.model.name.clone(),
            messages: vec![
                LlmMessage::new("system", prompt),
                LlmMessage::new("user", input.task.clone()),
            ],
            tools,
            dispatcher: Arc::new(SshToolDispatcher {
                guard: self.guard.clone(),
            }),
            thinking_mode: input.model.thinking_mode.clone(),
            max_iterations: SSH_MAX_ITERATIONS,
            message_id: ctx.message_id.clone(),
            cancel: input.cancel,
        });

        Ok(self
            .session_logger
            .wrap(ctx, &input.connection.id, "ssh", &input.task, stream)
            .await)
    }

    async fn build_prompt(&self, connection: &Connection, host_readme: &str) -> String {
        let mut prompt = String::from(SSH_BASE_PROMPT);
        prompt.push_str(&format!(
            "\n\nCurrent date/time: {}",
            Utc::now().format("%A, %Y-%m-%d %H:%M:%S UTC")
        ));

        if !connection.description.is_empty() {
            prompt.push_str(&format!(
                "\n\nServer: {}\nDescription: {}",
                connection.name, connection.description
            ));
        }

        if !host_readme.is_empty() {
            prompt.push_str("\n\n--- Host instruction (README.md) ---\n");
            prompt.push_str(host_readme);
            prompt.push_str("\n--- End of instruction ---");
        }

        if !connection.memories.is_empty() {
            prompt.push_str("\n\nYou already know about this server:");
            for memory in &connection.memories {
                prompt.push_str(&format!("\n- {}", memory.content));
            }
        }

        let guard_desc = self.guard.describe(&connection.profile_ids).await;
        if !guard_desc.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&guard_desc);
        }

        prompt
    }
}

fn execute_command_tool(config: SshConfig, profile_ids: Vec<String>) -> ToolSpec {
    ToolSpec {
        name: "execute_command".into(),
        description: "Execute a shell command on the remote server via SSH".into(),
        icon: "terminal",
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute",
                },
            },
            "required": ["command"],
        }),
        kind: ToolKind::ExecuteCommand {
            config,
            profile_ids,
        },
    }
}

/// Dispatcher for the sub-agent's single tool.
pub struct SshToolDispatcher {
    guard: Arc<Guard>,
}

#[async_trait]
impl ToolDispatcher for SshToolDispatcher {
    async fn dispatch(
        &self,
        _ctx: ToolContext,
        kind: ToolKind,
        args: String,
    ) -> Result<String, MantisError> {
        let ToolKind::ExecuteCommand {
            config,
            profile_ids,
        } = kind
        else {
            return Err(MantisError::Internal(
                "ssh dispatcher received a foreign tool".into(),
            ));
        };

        #[derive(Deserialize)]
        struct In {
            command: String,
        }
        let input: In = serde_json::from_str(&args)?;

        if let Some(violation) = self.guard.execute(&profile_ids, &input.command).await {
            return Ok(format!("[BLOCKED] {}", violation.message));
        }

        tokio::task::spawn_blocking(move || exec_command(&config, &input.command))
            .await
            .map_err(|e| MantisError::Internal(format!("ssh task failed: {e}")))?
    }
}

pub(crate) fn effective_port(config: &SshConfig) -> u16 {
    if config.port == 0 {
        22
    } else {
        config.port
    }
}

/// Opens an authenticated SSH session. Blocking.
pub(crate) fn dial(config: &SshConfig, timeout: Duration) -> Result<ssh2::Session, MantisError> {
    let port = effective_port(config);
    let addr = (config.host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| MantisError::Ssh {
            message: format!("resolve {}:{port}: {e}", config.host),
            source: Some(Box::new(e)),
        })?
        .next()
        .ok_or_else(|| MantisError::ssh(format!("no address for {}:{port}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| MantisError::Ssh {
        message: format!("ssh connect {addr}: {e}"),
        source: Some(Box::new(e)),
    })?;

    let mut session = ssh2::Session::new().map_err(ssh_err("ssh session"))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);
    session.handshake().map_err(ssh_err("ssh handshake"))?;

    if !config.password.is_empty() {
        if let Err(err) = session.userauth_password(&config.username, &config.password) {
            if config.private_key.is_empty() {
                return Err(ssh_err("ssh password auth")(err));
            }
        }
    }
    if !session.authenticated() && !config.private_key.is_empty() {
        session
            .userauth_pubkey_memory(&config.username, None, &config.private_key, None)
            .map_err(ssh_err("ssh key auth"))?;
    }
    if !session.authenticated() {
        return Err(MantisError::ssh("ssh authentication failed"));
    }
    Ok(session)
}

fn ssh_err(what: &'static str) -> impl Fn(ssh2::Error) -> MantisError {
    move |err| MantisError::Ssh {
        message: format!("{what}: {err}"),
        source: Some(Box::new(err)),
    }
}

/// Reads the host instruction file, empty when absent. Blocking.
pub(crate) fn probe_host(config: &SshConfig) -> Result<String, MantisError> {
    let session = dial(config, INTERACTIVE_TIMEOUT)?;
    let mut channel = session.channel_session().map_err(ssh_err("ssh channel"))?;
    channel
        .exec("cat ~/README.md 2>/dev/null || cat /etc/mantis/README.md 2>/dev/null")
        .map_err(ssh_err("ssh exec"))?;

    let mut stdout = Vec::new();
    let _ = channel.read_to_end(&mut stdout);
    let _ = channel.wait_close();
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

/// Runs one command, capturing stdout+stderr. Non-zero exits are reported in
/// the output rather than as errors so the model sees them. Blocking.
pub(crate) fn exec_command(config: &SshConfig, command: &str) -> Result<String, MantisError> {
    let session = dial(config, INTERACTIVE_TIMEOUT)?;
    let mut channel = session.channel_session().map_err(ssh_err("ssh channel"))?;
    channel.exec(command).map_err(ssh_err("ssh exec"))?;

    let mut stdout = Vec::new();
    let _ = channel.read_to_end(&mut stdout);
    let mut stderr = Vec::new();
    let _ = channel.stderr().read_to_end(&mut stderr);
    let _ = channel.wait_close();
    let exit = channel.exit_status().unwrap_or(-1);

    let mut output = String::from_utf8_lossy(&stdout).into_owned();
    if !stderr.is_empty() {
        output.push_str(&String::from_utf8_lossy(&stderr));
    }
    if output.len() > MAX_OUTPUT_BYTES {
        let total = output.len();
        let mut cut = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str(&format!(
            "\n\n[TRUNCATED: {MAX_OUTPUT_BYTES}/{total} bytes shown. Redirect to file and use grep/head/tail.]"
        ));
    }
    if exit != 0 {
        output.push_str(&format!("\nexit: status {exit}"));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::types::{CommandRule, GuardProfile};
    use mantis_test_utils::MemoryStore;

    #[tokio::test]
    async fn blocked_commands_return_blocked_text_not_error() {
        let profiles = MemoryStore::with_items(vec![GuardProfile {
            id: "ro".into(),
            commands: vec![CommandRule {
                command: "ls".into(),
                ..Default::default()
            }],
            ..Default::default()
        }]);
        let dispatcher = SshToolDispatcher {
            guard: Arc::new(Guard::new(Arc::new(profiles))),
        };

        let result = dispatcher
            .dispatch(
                ToolContext::default(),
                ToolKind::ExecuteCommand {
                    config: SshConfig::default(),
                    profile_ids: vec!["ro".into()],
                },
                r#"{"command":"rm -rf /"}"#.into(),
            )
            .await
            .unwrap();
        assert!(result.starts_with("[BLOCKED] "), "got {result:?}");
    }

    #[test]
    fn port_defaults_to_22() {
        assert_eq!(effective_port(&SshConfig::default()), 22);
        assert_eq!(
            effective_port(&SshConfig {
                port: 2222,
                ..Default::default()
            }),
            2222
        );
    }
}
