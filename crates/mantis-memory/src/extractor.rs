// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-turn memory extraction.
//!
//! Two LLM calls per turn: one diffs the user-fact list against the
//! conversation, one diffs each involved connection's memories against the
//! SSH task history. Both apply an add/remove diff (additions deduplicated,
//! removals by exact content match), which stays safe under concurrent edits.
//!
//! Runs detached from the request context; failures are logged and ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mantis_agent::pipeline::{MemoryExtractor as MemoryExtractorHook, SshStep};
use mantis_agent::{resolve_connection, resolve_model, sanitize_name};
use mantis_core::stream::collect_text;
use mantis_core::traits::llm::{ChatRequest, ChatStreamer, LlmMessage};
use mantis_core::types::{
    Config, Connection, ListQuery, LlmConnection, MemoryFact, Model,
};
use mantis_core::{MantisError, Store};
use serde::Deserialize;
use tracing::warn;

const USER_PROMPT: &str = r#"You manage a long-term memory system. You store facts the user wants remembered.
You receive existing facts and a recent conversation.

SAVE:
- Identity: name, language, role, company, timezone, location
- Preferences: tools, formats, styles, workflows
- Projects and goals the user is working on
- Anything the user explicitly asks to remember ("запиши", "запомни", "save this", etc.) — save the ACTUAL content, not a description of the request
- Specific knowledge the user shares in their OWN words: warnings, conclusions, decisions

DO NOT SAVE:
- Anything inside <file_content>...</file_content> tags — these are tool-extracted data (OCR, image descriptions, file previews, transcriptions), NOT user knowledge
- Product specs, labels, or metadata extracted from images — the user just shared a file, they didn't state these as personal facts
- Server/infrastructure details (that goes to server memory)
- Anything the assistant said that the user did not explicitly confirm or state themselves

CRITICAL: save the actual information, not meta-descriptions.
BAD: "likes to track prices of things" — this is a meta-description of behavior.
GOOD: "item X costs $50, item Y is unreliable" — this is the actual fact.

Time-sensitive facts (prices, rates, versions, stats) MUST include the date. If the date is unknown, do not save them.
BAD: "item X costs $50"
GOOD: "item X costs $50 (as of 2025-02-15)"

- REMOVE only facts the conversation explicitly contradicts or the user asks to forget.
- Do NOT remove facts just because they aren't mentioned.

Return strictly valid JSON:
{"add": [], "remove": []}
Example: {"add": ["uses Go and React for main project"], "remove": []}"#;

const CONNECTION_PROMPT: &str = r#"You manage a long-term memory system about a remote server.
You receive existing facts and recent SSH command history.

Worth remembering (only if clearly evident from the history):
- Installed or removed software/packages
- Config changes: edited files, changed values, new configs created
- Services: started, stopped, enabled, created
- Important paths: project dirs, config locations, log paths the user works with
- Problems found: broken configs, recurring errors, permission issues, failed upgrades
- Workarounds applied: if something didn't work and a workaround was used, save it so you don't repeat the debugging next time
- State changes after commands: if a command changed the server state in a meaningful way (new cron job, firewall rule, user created, etc.)
- Architecture: what runs on this server, how it connects to other services

NEVER save: disk/memory/cpu stats, process lists, file contents, query results, network info, uptime, log tails, or anything that changes on every check.

It is completely fine to return empty results. Most sessions have nothing worth adding.
Do NOT force facts out of routine checks — only save when something genuinely new or important happened.

- REMOVE only facts the history explicitly shows are no longer true.
- Do NOT remove facts just because they aren't mentioned.

Return strictly valid JSON:
{"add": [], "remove": []}
Only add when truly warranted: {"add": ["certbot renewal failing due to port 80 blocked by nginx, using dns challenge as workaround"], "remove": []}"#;

/// Output truncation for the per-connection history block.
const MAX_OUTPUT_CHARS: usize = 2000;

#[derive(Debug, Default, Deserialize)]
struct MemoryDiff {
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
}

/// LLM-backed fact extractor.
pub struct Extractor {
    llm: Arc<dyn ChatStreamer>,
    config_store: Arc<dyn Store<Config>>,
    connection_store: Arc<dyn Store<Connection>>,
    model_store: Arc<dyn Store<Model>>,
    llm_conn_store: Arc<dyn Store<LlmConnection>>,
}

impl Extractor {
    pub fn new(
        llm: Arc<dyn ChatStreamer>,
        config_store: Arc<dyn Store<Config>>,
        connection_store: Arc<dyn Store<Connection>>,
        model_store: Arc<dyn Store<Model>>,
        llm_conn_store: Arc<dyn Store<LlmConnection>>,
    ) -> Self {
        Extractor {
            llm,
            config_store,
            connection_store,
            model_store,
            llm_conn_store,
        }
    }

    async fn load_config(&self) -> Option<(Config, String, Vec<String>)> {
        let found = match self.config_store.get(&["default".to_string()]).await {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "memory: load config");
                return None;
            }
        };
        let config = found.get("default")?.clone();
        if config.data.get("memoryEnabled").and_then(|v| v.as_bool()) != Some(true) {
            return None;
        }
        let model_id = config
            .data
            .get("summaryModelId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let facts = config
            .data
            .get("userMemories")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some((config, model_id, facts))
    }

    async fn call_llm(
        &self,
        llm_conn: &LlmConnection,
        model: &Model,
        system_prompt: &str,
        user_input: String,
    ) -> Result<String, MantisError> {
        let stream = self
            .llm
            .chat_stream(ChatRequest {
                base_url: llm_conn.base_url.clone(),
                api_key: llm_conn.api_key.clone(),
                model: model.name.clone(),
                messages: vec![
                    LlmMessage::new("system", system_prompt),
                    LlmMessage::new("user", user_input),
                ],
                tools: Vec::new(),
                thinking_mode: "skip".into(),
            })
            .await?;
        let raw = collect_text(stream).await?;
        Ok(extract_json_object(&raw))
    }

    async fn extract_user(
        &self,
        llm_conn: &LlmConnection,
        model: &Model,
        config: Config,
        existing: Vec<String>,
        user_content: &str,
        assistant_content: &str,
    ) {
        if user_content.is_empty() || assistant_content.is_empty() {
            return;
        }

        let existing_json = serde_json::to_string(&existing).unwrap_or_else(|_| "[]".into());
        let input = format!(
            "Current date/time: {}\n\nExisting facts:\n{existing_json}\n\nConversation:\nUser: {user_content}\nAssistant: {assistant_content}",
            Utc::now().format("%A, %Y-%m-%d %H:%M:%S UTC"),
        );

        let raw = match self.call_llm(llm_conn, model, USER_PROMPT, input).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "memory: user extract");
                return;
            }
        };
        let diff: MemoryDiff = match serde_json::from_str(&raw) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(error = %err, raw = raw.as_str(), "memory: parse user diff");
                return;
            }
        };
        if diff.add.is_empty() && diff.remove.is_empty() {
            return;
        }

        self.save_user_facts(config, merge_facts(existing, &diff)).await;
    }

    async fn save_user_facts(&self, mut config: Config, facts: Vec<String>) {
        if let Some(object) = config.data.as_object_mut() {
            object.insert("userMemories".into(), serde_json::json!(facts));
        } else {
            config.data = serde_json::json!({ "userMemories": facts });
        }
        if let Err(err) = self.config_store.update(vec![config]).await {
            warn!(error = %err, "memory: save user facts");
        }
    }

    async fn extract_connections(
        &self,
        llm_conn: &LlmConnection,
        model: &Model,
        ssh_steps: Vec<SshStep>,
    ) {
        if ssh_steps.is_empty() {
            return;
        }

        let connections = match self.connection_store.list(ListQuery::default()).await {
            Ok(connections) => connections,
            Err(err) => {
                warn!(error = %err, "memory: list connections");
                return;
            }
        };

        let tool_to_conn: HashMap<String, &Connection> = connections
            .iter()
            .map(|c| (format!("ssh_{}", sanitize_name(&c.name)), c))
            .collect();

        let mut by_conn: HashMap<String, Vec<SshStep>> = HashMap::new();
        for step in ssh_steps {
            let Some(connection) = tool_to_conn.get(&step.tool_name) else {
                continue;
            };
            if !connection.memory_enabled {
                continue;
            }
            by_conn.entry(connection.id.clone()).or_default().push(step);
        }

        for (conn_id, steps) in by_conn {
            let Some(connection) = connections.iter().find(|c| c.id == conn_id) else {
                continue;
            };

            let existing: Vec<&str> = connection
                .memories
                .iter()
                .map(|m| m.content.as_str())
                .collect();
            let existing_json =
                serde_json::to_string(&existing).unwrap_or_else(|_| "[]".into());

            let mut history = String::new();
            for step in &steps {
                history.push_str(&format!(
                    "Task: {}\nOutput: {}\n\n",
                    step.task,
                    truncate(&step.result, MAX_OUTPUT_CHARS)
                ));
            }

            let input = format!(
                "Current date/time: {}\n\nExisting facts:\n{existing_json}\n\nSSH history:\n{history}",
                Utc::now().format("%A, %Y-%m-%d %H:%M:%S UTC"),
            );

            let raw = match self
                .call_llm(llm_conn, model, CONNECTION_PROMPT, input)
                .await
            {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, connection = conn_id.as_str(), "memory: connection extract");
                    continue;
                }
            };
            let diff: MemoryDiff = match serde_json::from_str(&raw) {
                Ok(diff) => diff,
                Err(err) => {
                    warn!(error = %err, raw = raw.as_str(), "memory: parse connection diff");
                    continue;
                }
            };
            if diff.add.is_empty() && diff.remove.is_empty() {
                continue;
            }

            let mut updated = connection.clone();
            updated.memories = apply_memory_diff(&connection.memories, &diff, &conn_id);
            if let Err(err) = self.connection_store.update(vec![updated]).await {
                warn!(error = %err, connection = conn_id.as_str(), "memory: save connection");
            }
        }
    }
}

#[async_trait]
impl MemoryExtractorHook for Extractor {
    async fn extract(
        &self,
        user_content: String,
        assistant_content: String,
        ssh_steps: Vec<SshStep>,
    ) {
        let Some((config, model_id, user_facts)) = self.load_config().await else {
            return;
        };
        if model_id.is_empty() {
            return;
        }

        let model = match resolve_model(self.model_store.as_ref(), &model_id).await {
            Ok(model) => model,
            Err(err) => {
                warn!(error = %err, "memory: resolve model");
                return;
            }
        };
        let llm_conn =
            match resolve_connection(self.llm_conn_store.as_ref(), &model.connection_id).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "memory: resolve llm connection");
                    return;
                }
            };

        self.extract_user(
            &llm_conn,
            &model,
            config,
            user_facts,
            &user_content,
            &assistant_content,
        )
        .await;
        self.extract_connections(&llm_conn, &model, ssh_steps).await;
    }
}

/// Applies a diff to a plain fact list: removals by exact match, additions
/// deduplicated.
fn merge_facts(existing: Vec<String>, diff: &MemoryDiff) -> Vec<String> {
    let remove: HashSet<&str> = diff.remove.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for fact in existing {
        if !remove.contains(fact.as_str()) && seen.insert(fact.clone()) {
            result.push(fact);
        }
    }
    for fact in &diff.add {
        if seen.insert(fact.clone()) {
            result.push(fact.clone());
        }
    }
    result
}

/// Applies a diff to a connection's memory records, minting ids for new
/// facts.
fn apply_memory_diff(
    memories: &[MemoryFact],
    diff: &MemoryDiff,
    conn_id: &str,
) -> Vec<MemoryFact> {
    let remove: HashSet<&str> = diff.remove.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut kept: Vec<MemoryFact> = Vec::new();
    for memory in memories {
        if !remove.contains(memory.content.as_str()) && seen.insert(memory.content.clone()) {
            kept.push(memory.clone());
        }
    }

    let now = Utc::now();
    let base = now.timestamp_millis();
    let id_prefix: String = conn_id.chars().take(8).collect();
    for (i, fact) in diff.add.iter().enumerate() {
        if seen.insert(fact.clone()) {
            kept.push(MemoryFact {
                id: format!("{id_prefix}-{}", base + i as i64),
                content: fact.clone(),
                created_at: now,
            });
        }
    }
    kept
}

/// Trims the model's answer down to the outermost JSON object.
fn extract_json_object(raw: &str) -> String {
    let raw = raw.trim();
    let Some(start) = raw.find('{') else {
        return raw.to_string();
    };
    let tail = &raw[start..];
    match tail.rfind('}') {
        Some(end) => tail[..=end].to_string(),
        None => tail.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_applies_diff_with_dedup() {
        let existing = vec!["a".to_string(), "b".to_string()];
        let diff = MemoryDiff {
            add: vec!["b".into(), "c".into()],
            remove: vec!["a".into()],
        };
        assert_eq!(merge_facts(existing, &diff), vec!["b", "c"]);
    }

    #[test]
    fn merge_ignores_unknown_removals() {
        let diff = MemoryDiff {
            add: vec![],
            remove: vec!["missing".into()],
        };
        assert_eq!(
            merge_facts(vec!["kept".into()], &diff),
            vec!["kept".to_string()]
        );
    }

    #[test]
    fn connection_diff_keeps_existing_records() {
        let memories = vec![
            MemoryFact {
                id: "old-1".into(),
                content: "nginx on 8080".into(),
                created_at: Utc::now(),
            },
            MemoryFact {
                id: "old-2".into(),
                content: "stale".into(),
                created_at: Utc::now(),
            },
        ];
        let diff = MemoryDiff {
            add: vec!["certbot uses dns challenge".into()],
            remove: vec!["stale".into()],
        };
        let result = apply_memory_diff(&memories, &diff, "abcdef1234");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "old-1");
        assert!(result[1].id.starts_with("abcdef12-"));
        assert_eq!(result[1].content, "certbot uses dns challenge");
    }

    #[test]
    fn json_object_is_extracted_from_noise() {
        assert_eq!(
            extract_json_object("Sure! {\"add\": [], \"remove\": []} done"),
            "{\"add\": [], \"remove\": []}"
        );
        assert_eq!(extract_json_object("no json here"), "no json here");
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        let text = "привет мир";
        let out = truncate(text, 7);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 10);
    }
}
