// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cron subsystem: an in-memory dispatcher reconciled against the stored
//! jobs every 30 seconds, plus job execution through the request pipeline.
//!
//! Reconciliation drops entries for deleted/disabled jobs and registers new
//! ones; an entry whose `(id, schedule)` pair is unchanged keeps its computed
//! next-fire instant, so `@every` intervals longer than the sync period still
//! fire. A per-job running set skips overlapping executions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mantis_agent::{
    Finally, ModelQuery, SessionMode, SessionPolicy, Workflow, WorkflowInput,
};
use mantis_core::traits::delivery::ResponseTo;
use mantis_core::traits::store::get_one;
use mantis_core::types::{Channel, Config, CronJob, ListQuery};
use mantis_core::{MantisError, Store};
use mantis_telegram::TelegramSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::schedule::{parse_schedule, ScheduleSpec};

const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const FIRE_TICK: Duration = Duration::from_secs(1);
const JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct Entry {
    job: CronJob,
    spec: ScheduleSpec,
    next_run: DateTime<Utc>,
}

/// In-memory schedule dispatcher.
#[derive(Default)]
pub struct Dispatcher {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Replaces the entry set from the stored jobs. Disabled jobs and jobs
    /// whose schedule fails to parse are skipped; a parse failure never
    /// aborts the reconciliation. Returns the number of active entries.
    pub fn sync(&self, jobs: &[CronJob], now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut next: HashMap<String, Entry> = HashMap::with_capacity(jobs.len());

        for job in jobs {
            if !job.enabled {
                continue;
            }
            let spec = match parse_schedule(&job.schedule) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(job_id = job.id.as_str(), error = err.as_str(), "cron: bad schedule");
                    continue;
                }
            };

            // An unchanged schedule keeps its computed fire time; otherwise
            // re-registering every sync would reset @every intervals forever.
            let next_run = match entries.remove(&job.id) {
                Some(existing) if existing.job.schedule == job.schedule => existing.next_run,
                _ => match spec.next_after(now) {
                    Some(next_run) => next_run,
                    None => continue,
                },
            };

            next.insert(
                job.id.clone(),
                Entry {
                    job: job.clone(),
                    spec,
                    next_run,
                },
            );
        }

        *entries = next;
        entries.len()
    }

    /// Jobs due at `now`; their next-fire instants advance past `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if entry.next_run > now {
                continue;
            }
            due.push(entry.job.clone());
            let mut next = entry.next_run;
            while next <= now {
                match entry.spec.next_after(next) {
                    Some(later) => next = later,
                    None => break,
                }
            }
            entry.next_run = next;
        }
        due
    }

    /// Ids of the registered entries.
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

/// The cron application: reconciliation loop plus job execution.
pub struct CronApp {
    cron_job_store: Arc<dyn Store<CronJob>>,
    config_store: Arc<dyn Store<Config>>,
    channel_store: Arc<dyn Store<Channel>>,
    session_policy: Arc<SessionPolicy>,
    workflow: Arc<Workflow>,
    dispatcher: Dispatcher,
    running: Arc<Mutex<HashSet<String>>>,
}

impl CronApp {
    pub fn new(
        cron_job_store: Arc<dyn Store<CronJob>>,
        config_store: Arc<dyn Store<Config>>,
        channel_store: Arc<dyn Store<Channel>>,
        session_policy: Arc<SessionPolicy>,
        workflow: Arc<Workflow>,
    ) -> Self {
        CronApp {
            cron_job_store,
            config_store,
            channel_store,
            session_policy,
            workflow,
            dispatcher: Dispatcher::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs the scheduler until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.sync_jobs().await;
        info!("cron: scheduler started");

        let mut sync_ticker = tokio::time::interval(SYNC_INTERVAL);
        sync_ticker.tick().await;
        let mut fire_ticker = tokio::time::interval(FIRE_TICK);
        fire_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cron: scheduler stopped");
                    return;
                }
                _ = sync_ticker.tick() => self.sync_jobs().await,
                _ = fire_ticker.tick() => {
                    for job in self.dispatcher.due(Utc::now()) {
                        let app = self.clone();
                        tokio::spawn(async move {
                            match app.execute_job(job.clone()).await {
                                Ok(true) => info!(job_id = job.id.as_str(), "cron: job launched"),
                                Ok(false) => info!(job_id = job.id.as_str(), "cron: job already running, skip"),
                                Err(err) => warn!(job_id = job.id.as_str(), error = %err, "cron: execute job"),
                            }
                        });
                    }
                }
            }
        }
    }

    async fn sync_jobs(&self) {
        match self.cron_job_store.list(ListQuery::default()).await {
            Ok(jobs) => {
                self.dispatcher.sync(&jobs, Utc::now());
            }
            Err(err) => warn!(error = %err, "cron: list jobs failed"),
        }
    }

    /// Runs one job: skip if already running, otherwise ensure its session
    /// and hand the prompt to the workflow. Returns whether it launched.
    pub async fn execute_job(&self, job: CronJob) -> Result<bool, MantisError> {
        if !self.mark_running(&job.id) {
            return Ok(false);
        }
        let unmark = {
            let running = self.running.clone();
            let job_id = job.id.clone();
            move || {
                running.lock().unwrap().remove(&job_id);
            }
        };

        let settings = match self.load_settings().await {
            Ok(settings) => settings,
            Err(err) => {
                unmark();
                return Err(err);
            }
        };

        let session_id = format!("cron:{}", job.id);
        if let Err(err) = self
            .session_policy
            .execute(SessionMode::Ensure {
                session_id: session_id.clone(),
            })
            .await
        {
            unmark();
            return Err(err);
        }

        let sender = match self.resolve_sender(&settings).await {
            Ok(sender) => sender,
            Err(err) => {
                unmark();
                return Err(err);
            }
        };

        self.workflow
            .execute(WorkflowInput {
                session_id,
                content: job.prompt.clone(),
                incoming: Vec::new(),
                model_query: ModelQuery {
                    config_path: vec!["cron".into(), "model_id".into()],
                    ..Default::default()
                },
                response_to: sender,
                source: "cron".into(),
                disable_history: true,
                error_prefix: "[Error]".into(),
                timeout: JOB_TIMEOUT,
                finally: Finally::new(unmark),
            })
            .await?;
        Ok(true)
    }

    async fn load_settings(&self) -> Result<CronSettings, MantisError> {
        let config = get_one(self.config_store.as_ref(), "default")
            .await?
            .ok_or_else(|| MantisError::NotFound("config \"default\" not found".into()))?;
        let cron = config.data.get("cron").cloned().unwrap_or_default();
        Ok(CronSettings {
            channel: cron
                .get("channel")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_lowercase(),
            sender: cron
                .get("sender")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string(),
        })
    }

    async fn resolve_sender(
        &self,
        settings: &CronSettings,
    ) -> Result<Option<Arc<dyn ResponseTo>>, MantisError> {
        if settings.channel.is_empty() {
            return Ok(None);
        }
        match settings.channel.as_str() {
            "telegram" => {
                let token = self.telegram_token().await?;
                if token.is_empty() {
                    return Err(MantisError::Validation(
                        "telegram channel configured but no token found".into(),
                    ));
                }
                Ok(Some(Arc::new(TelegramSender::new(&token, &settings.sender))))
            }
            other => Err(MantisError::Validation(format!(
                "unsupported delivery channel {other:?}"
            ))),
        }
    }

    async fn telegram_token(&self) -> Result<String, MantisError> {
        let channels = self.channel_store.list(ListQuery::default()).await?;
        Ok(channels
            .into_iter()
            .find(|c| c.kind == "telegram" && !c.token.is_empty())
            .map(|c| c.token)
            .unwrap_or_default())
    }

    fn mark_running(&self, job_id: &str) -> bool {
        self.running.lock().unwrap().insert(job_id.to_string())
    }
}

struct CronSettings {
    channel: String,
    sender: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(id: &str, schedule: &str, enabled: bool) -> CronJob {
        CronJob {
            id: id.into(),
            name: format!("job {id}"),
            schedule: schedule.into(),
            prompt: "do the thing".into(),
            enabled,
        }
    }

    #[test]
    fn sync_reconciles_enabled_parseable_jobs() {
        let dispatcher = Dispatcher::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap();

        // A pre-existing entry that no longer exists in the store.
        dispatcher.sync(&[job("old", "@every 30m", true)], now);
        assert_eq!(dispatcher.entry_ids(), vec!["old".to_string()]);

        let active = dispatcher.sync(
            &[
                job("job-1", "@every 30m", true),
                job("job-2", "@every 10m", false),
                job("job-3", "bad", true),
            ],
            now,
        );
        assert_eq!(active, 1);
        assert_eq!(dispatcher.entry_ids(), vec!["job-1".to_string()]);
    }

    #[test]
    fn unchanged_entries_keep_their_fire_time() {
        let dispatcher = Dispatcher::new();
        let start = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap();
        dispatcher.sync(&[job("j", "@every 10m", true)], start);

        // Re-syncing 30 seconds later must not push the fire time out.
        let resync = start + chrono::Duration::seconds(30);
        dispatcher.sync(&[job("j", "@every 10m", true)], resync);

        let due_before = dispatcher.due(start + chrono::Duration::minutes(9));
        assert!(due_before.is_empty());
        let due_after = dispatcher.due(start + chrono::Duration::minutes(10));
        assert_eq!(due_after.len(), 1);
        assert_eq!(due_after[0].id, "j");
    }

    #[test]
    fn changed_schedule_recomputes_fire_time() {
        let dispatcher = Dispatcher::new();
        let start = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap();
        dispatcher.sync(&[job("j", "@every 1m", true)], start);
        dispatcher.sync(&[job("j", "@every 1h", true)], start);

        assert!(dispatcher.due(start + chrono::Duration::minutes(5)).is_empty());
        assert_eq!(dispatcher.due(start + chrono::Duration::hours(1)).len(), 1);
    }

    #[test]
    fn due_advances_past_now() {
        let dispatcher = Dispatcher::new();
        let start = Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0).unwrap();
        dispatcher.sync(&[job("j", "@every 1m", true)], start);

        let late = start + chrono::Duration::minutes(5);
        assert_eq!(dispatcher.due(late).len(), 1);
        // Fired once; the next run is in the future, not a backlog replay.
        assert!(dispatcher.due(late).is_empty());
    }
}
