// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bot fleet supervisor: reconciles the stored telegram channels with live
//! long-poll workers every 30 seconds.
//!
//! A worker's identity key is its token plus the sorted allow-list; a changed
//! key cancels and restarts the worker. A worker that exits on its own only
//! removes its map entry while the stored key still matches, protecting
//! against the replace-then-exit race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mantis_core::types::{Channel, ListQuery};
use mantis_core::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::TelegramHandler;
use crate::worker::BotWorker;

const SYNC_INTERVAL: Duration = Duration::from_secs(30);

struct BotState {
    key: String,
    cancel: CancellationToken,
}

/// Keeps one worker per configured channel.
pub struct BotSupervisor {
    channel_store: Arc<dyn Store<Channel>>,
    handler: Arc<TelegramHandler>,
    bots: Mutex<HashMap<String, BotState>>,
}

impl BotSupervisor {
    pub fn new(channel_store: Arc<dyn Store<Channel>>, handler: Arc<TelegramHandler>) -> Self {
        BotSupervisor {
            channel_store,
            handler,
            bots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the reconciliation loop until cancelled, then stops all workers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.sync(&cancel).await;
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_all();
                    return;
                }
                _ = ticker.tick() => self.sync(&cancel).await,
            }
        }
    }

    /// Number of live workers (reconciliation observability + tests).
    pub fn live_bots(&self) -> usize {
        self.bots.lock().unwrap().len()
    }

    async fn sync(self: &Arc<Self>, parent: &CancellationToken) {
        let channels = match self.channel_store.list(ListQuery::default()).await {
            Ok(channels) => channels,
            Err(err) => {
                warn!(error = %err, "telegram: list channels failed");
                return;
            }
        };
        let desired: HashMap<String, Channel> = channels
            .into_iter()
            .filter(|c| c.kind == "telegram" && !c.token.trim().is_empty())
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut bots = self.bots.lock().unwrap();

        bots.retain(|id, state| {
            let keep = desired
                .get(id)
                .is_some_and(|channel| state.key == bot_key(channel));
            if !keep {
                info!(channel_id = id.as_str(), "telegram: stopping bot");
                state.cancel.cancel();
            }
            keep
        });

        for (id, channel) in &desired {
            if bots.contains_key(id) {
                continue;
            }
            let key = bot_key(channel);
            let token = parent.child_token();
            bots.insert(
                id.clone(),
                BotState {
                    key: key.clone(),
                    cancel: token.clone(),
                },
            );

            let worker = Arc::new(BotWorker::new(channel, self.handler.clone()));
            let supervisor = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                worker.run(token).await;
                // Only deregister if we were not already replaced.
                let mut bots = supervisor.bots.lock().unwrap();
                if bots.get(&id).is_some_and(|state| state.key == key) {
                    bots.remove(&id);
                }
            });
        }
    }

    fn stop_all(&self) {
        let mut bots = self.bots.lock().unwrap();
        for (_, state) in bots.drain() {
            state.cancel.cancel();
        }
    }
}

fn bot_key(channel: &Channel) -> String {
    let mut ids = channel.allowed_user_ids.clone();
    ids.sort_unstable();
    let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
    format!("{}|{}", channel.token, ids.join(","))
}
