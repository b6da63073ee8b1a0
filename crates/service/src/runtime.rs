// Service assembly: storage backend, gateways, scheduled jobs and router.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::InvitationAdmission;
use crate::api::{self, CallServices};
use crate::config::ServiceConfig;
use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool},
};
use crate::dialer::Dialer;
use crate::gateway::chat::HttpChatGateway;
use crate::gateway::events::{BroadcastEventPublisher, EventSink, HttpEventPublisher};
use crate::gateway::sfu::LiveKitGateway;
use crate::membership::CallMembership;
use crate::scheduler::{run_periodic, PeriodicTask};
use crate::store::CallStateStore;
use crate::synchronizer::Synchronizer;
use crate::task_lock::TaskLockManager;

pub const DIALER_TASK: &str = "dialer";
pub const SYNCHRONIZER_TASK: &str = "synchronizer";

/// A running service: the router to serve plus its background jobs.
pub struct Runtime {
    pub router: Router,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(config: &ServiceConfig) -> anyhow::Result<Self> {
        let (store, locks) = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, config.pool.clone())
                    .await
                    .context("failed to initialize call-state PostgreSQL pool")?;
                check_pool_health(&pool)
                    .await
                    .context("call-state PostgreSQL health check failed")?;
                run_migrations(&pool).await?;
                (
                    CallStateStore::Postgres(pool.clone()),
                    TaskLockManager::postgres(pool, config.task_lock_ttl),
                )
            }
            None => {
                warn!("CALLSYNC_DATABASE_URL not set; using the in-memory call-state store");
                (CallStateStore::memory(), TaskLockManager::memory(config.task_lock_ttl))
            }
        };

        if config.is_dev_sfu_secret() {
            warn!("using the development media server secret; set CALLSYNC_SFU_API_SECRET");
        }

        let sfu = Arc::new(LiveKitGateway::new(&config.sfu)?);
        let chat = Arc::new(HttpChatGateway::new(&config.chat_url)?);
        let events = Arc::new(match config.events_url.as_deref() {
            Some(url) => EventSink::Http(HttpEventPublisher::new(url)?),
            None => {
                let broadcast = BroadcastEventPublisher::default();
                tokio::spawn(log_events(broadcast.subscribe()));
                EventSink::Broadcast(broadcast)
            }
        });

        let reconcile = config.reconcile.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let holder_id = Uuid::new_v4();

        let dialer = Arc::new(Dialer::new(
            store.clone(),
            Arc::clone(&chat),
            Arc::clone(&events),
            reconcile.clone(),
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            store.clone(),
            Arc::clone(&sfu),
            Arc::clone(&chat),
            Arc::clone(&events),
            reconcile.clone(),
        ));

        let tasks = vec![
            tokio::spawn(run_periodic(
                PeriodicTask { name: DIALER_TASK, interval: reconcile.dialer_interval },
                locks.clone(),
                holder_id,
                move || {
                    let dialer = Arc::clone(&dialer);
                    async move {
                        dialer.run_once().await;
                    }
                },
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_periodic(
                PeriodicTask { name: SYNCHRONIZER_TASK, interval: reconcile.synchronizer_interval },
                locks,
                holder_id,
                move || {
                    let synchronizer = Arc::clone(&synchronizer);
                    async move {
                        synchronizer.run_once().await;
                    }
                },
                shutdown_rx,
            )),
        ];

        let router = api::router(CallServices {
            admission: InvitationAdmission::new(
                store.clone(),
                Arc::clone(&chat),
                reconcile.external_call_timeout,
            ),
            membership: CallMembership::new(
                store,
                chat,
                sfu,
                events,
                reconcile.external_call_timeout,
            ),
        });

        info!(%holder_id, "call-state runtime started");
        Ok(Self { router, shutdown_tx, tasks })
    }

    /// Stop the scheduled jobs and release their task locks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(%error, "scheduled task ended abnormally");
            }
        }
        info!("call-state runtime stopped");
    }
}

async fn log_events(mut receiver: broadcast::Receiver<callsync_common::events::CallEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(payload) => debug!(event = event.kind(), %payload, "call event"),
                Err(error) => warn!(event = event.kind(), %error, "failed to encode call event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "call event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
