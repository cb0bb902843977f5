// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `mantis serve` command implementation.
//!
//! Wires the SQLite entity stores, the OpenAI-compatible LLM client, the
//! command guard, the orchestrator and pipeline, the cron scheduler and the
//! Telegram bot fleet. The HTTP surface here is only a health probe; CRUD
//! endpoints live in the web panel service. Shuts down cleanly on Ctrl-C,
//! cancelling both supervisors.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use mantis_agent::{
    Buffer, MantisAgent, ModelResolver, RequestPipeline, SessionLogger, SessionPolicy, SshAgent,
    Workflow,
};
use mantis_artifact::ArtifactManager;
use mantis_core::types::{
    Channel, ChatMessage, ChatSession, Config, Connection, CronJob, GuardProfile, LlmConnection,
    Model, SessionLog,
};
use mantis_core::{Asr, MantisError, Ocr, Store, Tts};
use mantis_cron::{parse_schedule, CronApp};
use mantis_guard::Guard;
use mantis_media::{AsrClient, OcrClient, TtsClient};
use mantis_memory::Extractor;
use mantis_openai::{OpenAiClient, VisionClient};
use mantis_storage::{Database, SqliteStore};
use mantis_telegram::{BotSupervisor, TelegramHandler};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MEDIA_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn env(key: &str, fallback: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| fallback.to_string())
}

fn store<E: mantis_core::types::Entity>(db: &Database) -> Arc<SqliteStore<E>> {
    Arc::new(SqliteStore::new(db.clone()))
}

pub async fn run_serve() -> Result<(), MantisError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let database_url = env("DATABASE_URL", "mantis.db");
    let database_path = database_url
        .strip_prefix("sqlite://")
        .unwrap_or(&database_url)
        .to_string();
    let port: u16 = env("PORT", "8080")
        .parse()
        .map_err(|e| MantisError::Validation(format!("invalid PORT: {e}")))?;

    let db = Database::open(&database_path).await?;
    info!(path = database_path.as_str(), "storage ready");

    let config_store: Arc<SqliteStore<Config>> = store(&db);
    let llm_conn_store: Arc<SqliteStore<LlmConnection>> = store(&db);
    let model_store: Arc<SqliteStore<Model>> = store(&db);
    let connection_store: Arc<SqliteStore<Connection>> = store(&db);
    let cron_job_store: Arc<SqliteStore<CronJob>> = store(&db);
    let session_store: Arc<SqliteStore<ChatSession>> = store(&db);
    let message_store: Arc<SqliteStore<ChatMessage>> = store(&db);
    let log_store: Arc<SqliteStore<SessionLog>> = store(&db);
    let guard_profile_store: Arc<SqliteStore<GuardProfile>> = store(&db);
    let channel_store: Arc<SqliteStore<Channel>> = store(&db);

    let llm = Arc::new(OpenAiClient::new()?);
    let guard = Arc::new(Guard::new(guard_profile_store.clone() as Arc<dyn Store<GuardProfile>>));
    let session_logger = Arc::new(SessionLogger::new(log_store.clone() as Arc<dyn Store<SessionLog>>));

    let asr: Option<Arc<dyn Asr>> = match env("ASR_API_URL", "").as_str() {
        "" => None,
        url => Some(Arc::new(AsrClient::new(url, MEDIA_TIMEOUT)?)),
    };
    let ocr: Option<Arc<dyn Ocr>> = match env("OCR_API_URL", "").as_str() {
        "" => None,
        url => Some(Arc::new(OcrClient::new(url, MEDIA_TIMEOUT)?)),
    };
    let tts: Option<Arc<dyn Tts>> = match env("TTS_API_URL", "").as_str() {
        "" => None,
        url => Some(Arc::new(TtsClient::new(url, MEDIA_TIMEOUT)?)),
    };

    let ssh_agent = SshAgent::new(
        llm_conn_store.clone(),
        llm.clone(),
        guard.clone(),
        session_logger.clone(),
    );

    let agent = Arc::new(MantisAgent::new(
        message_store.clone(),
        model_store.clone(),
        llm_conn_store.clone(),
        connection_store.clone(),
        cron_job_store.clone(),
        config_store.clone(),
        llm.clone(),
        ssh_agent,
        asr.clone(),
        ocr,
        Some(Arc::new(VisionClient::new()?)),
        Arc::new(|expr: &str| parse_schedule(expr).map(|_| ())),
    ));

    let buffer = Arc::new(Buffer::new());
    let artifact_manager = Arc::new(ArtifactManager::new());
    let memory_extractor = Arc::new(Extractor::new(
        llm.clone(),
        config_store.clone(),
        connection_store.clone(),
        model_store.clone(),
        llm_conn_store.clone(),
    ));

    let model_resolver = Arc::new(ModelResolver::new(
        Some(channel_store.clone() as Arc<dyn Store<Channel>>),
        Some(config_store.clone() as Arc<dyn Store<Config>>),
    ));
    let pipeline = Arc::new(RequestPipeline::new(
        agent,
        buffer.clone(),
        message_store.clone(),
        model_store.clone(),
        model_resolver,
        Some(memory_extractor),
    ));
    let workflow = Arc::new(Workflow::new(
        pipeline,
        message_store.clone(),
        artifact_manager,
    ));

    let session_policy = Arc::new(SessionPolicy::new(session_store.clone() as Arc<dyn Store<ChatSession>>));

    let telegram_handler = Arc::new(TelegramHandler::new(
        channel_store.clone(),
        message_store.clone(),
        model_store.clone(),
        session_policy.clone(),
        workflow.clone(),
        buffer,
        asr,
        tts,
    ));
    let bot_supervisor = Arc::new(BotSupervisor::new(channel_store.clone(), telegram_handler));

    let cron_app = Arc::new(CronApp::new(
        cron_job_store,
        config_store,
        channel_store,
        session_policy,
        workflow,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(bot_supervisor.run(shutdown.child_token()));
    tokio::spawn(cron_app.run(shutdown.child_token()));

    let router = Router::new().route("/healthz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| MantisError::Internal(format!("bind port {port}: {e}")))?;
    info!(port, "listening");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
    let server_task = tokio::spawn(async move {
        server
            .await
            .map_err(|e| MantisError::Internal(format!("http server: {e}")))
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MantisError::Internal(format!("signal handler: {e}")))?;
    info!("shutting down");
    shutdown.cancel();

    server_task
        .await
        .map_err(|e| MantisError::Internal(format!("server task: {e}")))?
}
