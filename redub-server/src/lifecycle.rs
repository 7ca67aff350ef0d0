use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use redub_core::{Config, Role};
use redub_dispatch::{AutoDispatch, AutoPolicy, DispatchBackend, OutboxFlusher};
use redub_engine::worker::recover_interrupted_jobs;
use redub_engine::{
    CancelRegistry, OutputLayout, Pipeline, RetentionSweeper, Scheduler, SchedulerConfig,
    WorkerConfig, WorkerPool,
};
use redub_events::{EventHub, HubConfig};
use redub_policy::{CsrfGuard, IdentityResolver, NetGate, ObjectAccess, RateLimiter};
use redub_store::MetaStore;
use redub_upload::UploadStore;

use crate::AppState;

/// Supervised process state: the shutdown signal, every background task
/// handle, and the worker pool handles, so the drain sequence can await
/// each of them explicitly.
pub struct Lifecycle {
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    workers: Vec<JoinHandle<()>>,
}

/// Boot in dependency order: store, upload store, event hub, dispatch
/// probe, scheduler, interrupted-job recovery, workers and background
/// tasks. The HTTP listener is the caller's last step.
pub async fn boot(config: Config, pipeline: Pipeline) -> anyhow::Result<Lifecycle> {
    let config = Arc::new(config);

    let meta = Arc::new(
        MetaStore::open(&config.state_dir, &config.log_dir)
            .await
            .context("opening metadata store")?,
    );
    let uploads = Arc::new(UploadStore::new(meta.clone(), &config).context("opening upload store")?);
    let hub = EventHub::new(HubConfig::default());

    let dispatch = Arc::new(
        AutoDispatch::new(
            config.queue_backend,
            config.redis_url.as_deref(),
            (config.backpressure_q_max * 4).max(256),
            AutoPolicy::default(),
            hub.clone(),
            meta.clone(),
        )
        .await,
    );

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from_config(&config),
        meta.clone(),
        dispatch.clone() as Arc<dyn DispatchBackend>,
        hub.clone(),
    ));

    let recovered = recover_interrupted_jobs(&meta)
        .await
        .context("recovering interrupted jobs")?;
    if recovered > 0 {
        info!(count = recovered, "requeued interrupted jobs");
    }

    ensure_bootstrap_admin(&meta).await?;

    let cancels = Arc::new(CancelRegistry::new());
    let layout = OutputLayout::new(&config.output_dir).context("preparing output layout")?;
    let resolver = Arc::new(IdentityResolver::new(
        meta.clone(),
        &config.jwt_secret,
        &config.session_secret,
    ));
    let csrf = Arc::new(CsrfGuard::new(&config.csrf_secret));
    let limiter = Arc::new(RateLimiter::new());
    let gate = Arc::new(NetGate::new(&config));
    let access = Arc::new(ObjectAccess::new(meta.clone(), &config.output_dir));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Dispatch health probing with hysteresis.
    tasks.push((
        "dispatch-probe",
        tokio::spawn(dispatch.clone().probe_loop(shutdown_rx.clone())),
    ));

    // Outbox flusher: durable submissions reach a backend.
    let flusher = OutboxFlusher::new(meta.clone(), dispatch.clone(), Duration::from_millis(500));
    tasks.push(("outbox-flusher", tokio::spawn(flusher.run(shutdown_rx.clone()))));

    // Upload abandonment GC plus rate-limiter compaction.
    {
        let uploads = uploads.clone();
        let limiter = limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push((
            "upload-gc",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = uploads.sweep_expired().await {
                                warn!(error = %err, "upload sweep failed");
                            }
                            limiter.compact();
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }),
        ));
    }

    // Retention sweeper.
    let sweeper = RetentionSweeper::new(
        meta.clone(),
        layout.clone(),
        config.retention_policy,
        config.retention_sweep_interval,
    );
    tasks.push(("retention", tokio::spawn(sweeper.run(shutdown_rx.clone()))));

    // Worker pool.
    let pool = WorkerPool::new(
        WorkerConfig::from_config(&config),
        meta.clone(),
        dispatch.clone() as Arc<dyn DispatchBackend>,
        scheduler.clone(),
        hub.clone(),
        cancels.clone(),
        pipeline,
        layout.clone(),
        config.uploads_dir.clone(),
    );
    let workers = pool.start(shutdown_rx);

    let state = AppState {
        config,
        meta,
        uploads,
        dispatch,
        scheduler,
        hub,
        cancels,
        resolver,
        csrf,
        limiter,
        gate,
        access,
        layout,
        draining: Arc::new(AtomicBool::new(false)),
    };

    Ok(Lifecycle {
        state,
        shutdown_tx,
        tasks,
        workers,
    })
}

/// First boot on an empty auth database creates the initial admin, from
/// `REDUB_ADMIN_LOGIN`/`REDUB_ADMIN_PASSWORD` or with a generated
/// password surfaced once in the log.
async fn ensure_bootstrap_admin(meta: &MetaStore) -> anyhow::Result<()> {
    if meta.count_users().await? > 0 {
        return Ok(());
    }
    let login = std::env::var("REDUB_ADMIN_LOGIN").unwrap_or_else(|_| "admin".to_string());
    let (password, generated) = match std::env::var("REDUB_ADMIN_PASSWORD") {
        Ok(password) if !password.is_empty() => (password, false),
        _ => (uuid::Uuid::new_v4().simple().to_string(), true),
    };
    meta.create_user(&login, &password, Role::Admin).await?;
    if generated {
        warn!(login, password, "created bootstrap admin with generated password; rotate it");
    } else {
        info!(login, "created bootstrap admin");
    }
    Ok(())
}

impl Lifecycle {
    /// Ordered drain, per the lifecycle contract:
    /// 1. flip the draining flag (submits now 503 with Retry-After),
    /// 2. stop the scheduler admitting,
    /// 3. signal every background task and worker,
    /// 4. wait for workers to finish their current stage and release leases,
    /// 5. close the dispatch backends,
    /// 6. close the event hub (terminal events to subscribers),
    /// 7. flush and close the store.
    pub async fn shutdown(self, grace: Duration) {
        info!("shutdown: draining");
        self.state.draining.store(true, Ordering::Release);
        self.state.scheduler.stop_admitting();
        let _ = self.shutdown_tx.send(true);

        for handle in self.workers {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("worker did not stop within grace period");
            }
        }

        for (name, handle) in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(task = name, "background task did not stop in time");
            }
        }

        self.state.dispatch.close().await;
        self.state.hub.close();
        self.state.meta.close().await;
        info!("shutdown complete");
    }
}
