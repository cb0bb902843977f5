// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entity types shared across the Mantis workspace.
//!
//! All entities serialize with camelCase field names; that is both the wire
//! format and the JSON document format the storage layer persists.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// A persistable record: knows its table name and its primary key.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Storage table name.
    const TABLE: &'static str;

    /// Primary key of this record.
    fn id(&self) -> &str;
}

/// One conversation thread. Sessions with an id prefixed `cron:` are
/// synthetic containers for scheduled jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for ChatSession {
    const TABLE: &'static str = "chat_sessions";
    fn id(&self) -> &str {
        &self.id
    }
}

/// A single message within a session.
///
/// For every user message there is exactly one paired assistant message
/// created one millisecond later. `status` is empty for finished messages,
/// `pending` while the reply streams, `error` after a failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    /// "user", "assistant" or "tool".
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub status: String,
    /// Originating channel: "web", "telegram" or "cron".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    /// JSON-encoded tool steps, present once the reply finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Entity for ChatMessage {
    const TABLE: &'static str = "chat_messages";
    fn id(&self) -> &str {
        &self.id
    }
}

/// One tool invocation inside a turn.
///
/// `content_offset` records the assistant content length at the moment the
/// tool started, which lets front-ends interleave steps with text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub tool: String,
    pub label: String,
    pub icon: String,
    /// Raw JSON argument text as sent by the model.
    pub args: String,
    /// "running" or "completed".
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(default)]
    pub content_offset: usize,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finished_at: String,
}

/// An LLM model attached to a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub connection_id: String,
    pub name: String,
    /// "", "skip" or "inline": how `<think>` blocks are handled.
    #[serde(default)]
    pub thinking_mode: String,
}

impl Entity for Model {
    const TABLE: &'static str = "models";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Credentials for an OpenAI-compatible LLM endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConnection {
    pub id: String,
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
}

impl Entity for LlmConnection {
    const TABLE: &'static str = "llm_connections";
    fn id(&self) -> &str {
        &self.id
    }
}

/// A long-term fact remembered about a remote host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFact {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A remote system the assistant can drive. Currently only `type = "ssh"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model_id: String,
    /// Opaque per-type configuration (for SSH: [`SshConfig`]).
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub memories: Vec<MemoryFact>,
    /// Guard profiles constraining shell commands on this host.
    #[serde(default)]
    pub profile_ids: Vec<String>,
    /// Whether post-turn memory extraction may write to this connection.
    #[serde(default)]
    pub memory_enabled: bool,
}

impl Entity for Connection {
    const TABLE: &'static str = "connections";
    fn id(&self) -> &str {
        &self.id
    }
}

/// SSH endpoint parameters, decoded from [`Connection::config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
}

/// A scheduled prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// 5-field cron expression or `@every`/`@hourly` style descriptor.
    pub schedule: String,
    pub prompt: String,
    pub enabled: bool,
}

impl Entity for CronJob {
    const TABLE: &'static str = "cron_jobs";
    fn id(&self) -> &str {
        &self.id
    }
}

/// A delivery endpoint. Currently only `type = "telegram"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,
}

impl Entity for Channel {
    const TABLE: &'static str = "channels";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Capability flags of a guard profile. `unrestricted` short-circuits to
/// permit everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardCapabilities {
    pub pipes: bool,
    pub redirects: bool,
    pub cmd_subst: bool,
    pub background: bool,
    pub sudo: bool,
    pub code_exec: bool,
    pub download: bool,
    pub install: bool,
    pub write_fs: bool,
    pub network_out: bool,
    pub cron: bool,
    pub unrestricted: bool,
}

impl GuardCapabilities {
    /// OR-merge of two capability sets.
    pub fn merge(self, other: GuardCapabilities) -> GuardCapabilities {
        GuardCapabilities {
            pipes: self.pipes || other.pipes,
            redirects: self.redirects || other.redirects,
            cmd_subst: self.cmd_subst || other.cmd_subst,
            background: self.background || other.background,
            sudo: self.sudo || other.sudo,
            code_exec: self.code_exec || other.code_exec,
            download: self.download || other.download,
            install: self.install || other.install,
            write_fs: self.write_fs || other.write_fs,
            network_out: self.network_out || other.network_out,
            cron: self.cron || other.cron,
            unrestricted: self.unrestricted || other.unrestricted,
        }
    }
}

/// A whitelisted command, optionally constrained to specific first arguments
/// or SQL leading keywords.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRule {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_sql: Vec<String>,
}

/// A named capability + command whitelist for SSH sub-agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default)]
    pub capabilities: GuardCapabilities,
    #[serde(default)]
    pub commands: Vec<CommandRule>,
}

impl Entity for GuardProfile {
    const TABLE: &'static str = "guard_profiles";
    fn id(&self) -> &str {
        &self.id
    }
}

/// One entry in a session log trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// "thought", "command", "output" or "error".
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A durable trace of one sub-agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: String,
    pub connection_id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    /// "running" or "finished".
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Entity for SessionLog {
    const TABLE: &'static str = "session_logs";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Global configuration knobs as an opaque JSON document, keyed "default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl Entity for Config {
    const TABLE: &'static str = "configs";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

/// One sort term: JSON field name plus direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub dir: SortDir,
}

/// Pagination window. A zero limit means "no limit".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

/// Declarative list query: AND filters, AND-NOT filters, multi-field sort,
/// pagination. Field names are the camelCase JSON field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Page,
    #[serde(default)]
    pub filter: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub filter_not: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub sort: Vec<Sort>,
}

impl ListQuery {
    /// A query with a single equality filter.
    pub fn filter_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        let mut q = ListQuery::default();
        q.filter.insert(field.into(), value.into());
        q
    }
}
