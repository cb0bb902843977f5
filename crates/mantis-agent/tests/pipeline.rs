// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end pipeline tests against a scripted LLM: the workflow persists
//! the user/pending pair, the pipeline mirrors progress into the buffer,
//! finalises the assistant row, and delivers to the response sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mantis_agent::{
    Buffer, Finally, MantisAgent, ModelQuery, ModelResolver, RequestPipeline, SessionLogger,
    SshAgent, Workflow, WorkflowInput,
};
use mantis_artifact::ArtifactManager;
use mantis_core::traits::delivery::{DeliveryRequest, ResponseTo};
use mantis_core::traits::llm::ChatStreamer;
use mantis_core::types::{
    ChatMessage, Config, Connection, CronJob, GuardProfile, ListQuery, LlmConnection, Model,
    SessionLog, Step,
};
use mantis_core::{MantisError, Store, StreamEvent, ToolCall};
use mantis_guard::Guard;
use mantis_test_utils::{MemoryStore, ScriptedLlm};
use serde_json::json;
use tokio::sync::oneshot;

struct Fixture {
    workflow: Arc<Workflow>,
    message_store: Arc<MemoryStore<ChatMessage>>,
    buffer: Arc<Buffer>,
}

fn fixture(llm: Arc<dyn ChatStreamer>) -> Fixture {
    let message_store = Arc::new(MemoryStore::<ChatMessage>::new());
    let model_store = Arc::new(MemoryStore::with_items(vec![Model {
        id: "m1".into(),
        connection_id: "c1".into(),
        name: "test-model".into(),
        thinking_mode: String::new(),
    }]));
    let llm_conn_store = Arc::new(MemoryStore::with_items(vec![LlmConnection {
        id: "c1".into(),
        provider: "openai".into(),
        base_url: "http://llm".into(),
        api_key: "key".into(),
    }]));
    let connection_store = Arc::new(MemoryStore::<Connection>::new());
    let cron_store = Arc::new(MemoryStore::<CronJob>::new());
    let config_store = Arc::new(MemoryStore::with_items(vec![Config {
        id: "default".into(),
        data: json!({"chat": {"model_id": "m1"}}),
    }]));
    let guard = Arc::new(Guard::new(Arc::new(MemoryStore::<GuardProfile>::new())));
    let session_logger = Arc::new(SessionLogger::new(
        Arc::new(MemoryStore::<SessionLog>::new()) as Arc<dyn Store<SessionLog>>,
    ));

    let ssh_agent = SshAgent::new(llm_conn_store.clone(), llm.clone(), guard, session_logger);
    let agent = Arc::new(MantisAgent::new(
        message_store.clone(),
        model_store.clone(),
        llm_conn_store,
        connection_store,
        cron_store,
        config_store.clone(),
        llm,
        ssh_agent,
        None,
        None,
        None,
        Arc::new(|_expr: &str| Ok(())),
    ));

    let buffer = Arc::new(Buffer::new());
    let resolver = Arc::new(ModelResolver::new(None, Some(config_store)));
    let pipeline = Arc::new(RequestPipeline::new(
        agent,
        buffer.clone(),
        message_store.clone(),
        model_store,
        resolver,
        None,
    ));
    let workflow = Arc::new(Workflow::new(
        pipeline,
        message_store.clone(),
        Arc::new(ArtifactManager::new()),
    ));

    Fixture {
        workflow,
        message_store,
        buffer,
    }
}

struct RecordingSink {
    delivered: Mutex<Vec<DeliveryRequest>>,
}

#[async_trait]
impl ResponseTo for RecordingSink {
    async fn execute(&self, req: DeliveryRequest) -> Result<(), MantisError> {
        self.delivered.lock().unwrap().push(req);
        Ok(())
    }
    fn recipient(&self) -> &str {
        "12345"
    }
    fn channel(&self) -> &str {
        "telegram"
    }
}

fn workflow_input(finally: Finally) -> WorkflowInput {
    WorkflowInput {
        session_id: "s1".into(),
        content: "add one and one".into(),
        incoming: Vec::new(),
        model_query: ModelQuery {
            config_path: vec!["chat".into(), "model_id".into()],
            ..Default::default()
        },
        response_to: None,
        source: "web".into(),
        disable_history: false,
        error_prefix: "[Error]".into(),
        timeout: Duration::from_secs(30),
        finally,
    }
}

#[tokio::test]
async fn successful_turn_persists_content_and_steps() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        vec![
            StreamEvent::text("Let me compute. "),
            StreamEvent::tool_calls(vec![ToolCall {
                id: "call-1".into(),
                name: "sum".into(),
                arguments: r#"{"numbers":[1,1]}"#.into(),
            }]),
        ],
        vec![StreamEvent::text("The sum is 2.")],
    ]));
    let fx = fixture(llm);

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let out = fx
        .workflow
        .execute(workflow_input(Finally::new(move || {
            let _ = done_tx.send(());
        })))
        .await
        .unwrap();

    // The pending pair exists immediately, one millisecond apart.
    assert_eq!(out.assistant_message.status, "pending");
    assert!(out.assistant_message.created_at > out.user_message.created_at);
    assert_eq!(out.user_message.session_id, out.assistant_message.session_id);
    assert_eq!(out.user_message.source, out.assistant_message.source);

    done_rx.await.unwrap();

    let stored = fx
        .message_store
        .get(&[out.assistant_message.id.clone()])
        .await
        .unwrap();
    let final_message = &stored[&out.assistant_message.id];
    assert_eq!(final_message.status, "");
    assert_eq!(final_message.content, "Let me compute. The sum is 2.");
    assert_eq!(final_message.model_name, "test-model");

    let steps: Vec<Step> =
        serde_json::from_value(final_message.steps.clone().unwrap()).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].tool, "sum");
    assert_eq!(steps[0].status, "completed");
    assert_eq!(steps[0].result, "2");
    // The step started after the first text chunk and within the final text.
    assert_eq!(steps[0].content_offset, "Let me compute. ".len());
    assert!(steps[0].content_offset <= final_message.content.len());

    // The live buffer entry is gone once the turn finished.
    assert!(fx.buffer.get(&out.assistant_message.id).is_none());
}

#[tokio::test]
async fn llm_failure_finalises_with_error_status() {
    let llm = Arc::new(ScriptedLlm::new(vec![vec![
        StreamEvent::text("partial"),
        StreamEvent::error("upstream exploded"),
    ]]));
    let fx = fixture(llm);

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let out = fx
        .workflow
        .execute(workflow_input(Finally::new(move || {
            let _ = done_tx.send(());
        })))
        .await
        .unwrap();
    done_rx.await.unwrap();

    let stored = fx
        .message_store
        .get(&[out.assistant_message.id.clone()])
        .await
        .unwrap();
    let final_message = &stored[&out.assistant_message.id];
    assert_eq!(final_message.status, "error");
    assert!(final_message.content.starts_with("partial"));
    assert!(final_message.content.contains("[Error]"));
    assert!(final_message.content.contains("upstream exploded"));
}

#[tokio::test]
async fn unresolvable_model_still_produces_an_assistant_row() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let fx = fixture(llm);

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let mut input = workflow_input(Finally::new(move || {
        let _ = done_tx.send(());
    }));
    // Points at a config path that does not exist.
    input.model_query = ModelQuery {
        config_path: vec!["nope".into(), "model_id".into()],
        ..Default::default()
    };

    let out = fx.workflow.execute(input).await.unwrap();
    done_rx.await.unwrap();

    let stored = fx
        .message_store
        .get(&[out.assistant_message.id.clone()])
        .await
        .unwrap();
    let final_message = &stored[&out.assistant_message.id];
    assert_eq!(final_message.status, "error");
    assert!(final_message.content.contains("model not configured"));
}

#[tokio::test]
async fn delivery_sink_receives_text_and_steps() {
    let llm = Arc::new(ScriptedLlm::new(vec![vec![StreamEvent::text("hi there")]]));
    let fx = fixture(llm);
    let sink = Arc::new(RecordingSink {
        delivered: Mutex::new(Vec::new()),
    });

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let mut input = workflow_input(Finally::new(move || {
        let _ = done_tx.send(());
    }));
    input.response_to = Some(sink.clone());
    fx.workflow.execute(input).await.unwrap();
    done_rx.await.unwrap();

    let delivered = sink.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text, "hi there");
}

#[tokio::test]
async fn history_reaches_the_llm_on_later_turns() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        vec![StreamEvent::text("first reply")],
        vec![StreamEvent::text("second reply")],
    ]));
    let fx = fixture(llm.clone());

    for _ in 0..2 {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        fx.workflow
            .execute(workflow_input(Finally::new(move || {
                let _ = done_tx.send(());
            })))
            .await
            .unwrap();
        done_rx.await.unwrap();
    }

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    // Second turn: system + (user, assistant) of turn one + user of turn two.
    let roles: Vec<&str> = requests[1]
        .messages
        .iter()
        .map(|m| m.role.as_str())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    assert_eq!(requests[1].messages[2].content, "first reply");

    let all = fx.message_store.list(ListQuery::default()).await.unwrap();
    assert_eq!(all.len(), 4);
}
