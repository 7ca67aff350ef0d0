use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use redub_core::RetentionPolicy;
use redub_store::{JobFilter, JobState, MetaStore};

use crate::layout::OutputLayout;

/// Artifact subdirectories pruned by the `balanced` policy once a job is
/// done: working material nobody serves.
const BALANCED_PRUNE: &[&str] = &["analysis", "qa", "review"];

/// Additional subdirectories pruned by `minimal`: everything except the
/// final outputs at the stem root and the mixed audio.
const MINIMAL_PRUNE: &[&str] = &["analysis", "qa", "review", "mobile", "subs", "manifests"];

/// Policy-driven artifact pruning for settled jobs.
pub struct RetentionSweeper {
    meta: Arc<MetaStore>,
    layout: OutputLayout,
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        meta: Arc<MetaStore>,
        layout: OutputLayout,
        policy: RetentionPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            meta,
            layout,
            policy,
            interval,
        }
    }

    /// One sweep over completed jobs. Returns how many directories were
    /// pruned. Idempotent: pruning an already-pruned job is a no-op.
    pub async fn sweep_once(&self) -> usize {
        let prune: &[&str] = match self.policy {
            RetentionPolicy::Full => return 0,
            RetentionPolicy::Balanced => BALANCED_PRUNE,
            RetentionPolicy::Minimal => MINIMAL_PRUNE,
        };

        let page = match self
            .meta
            .list_jobs(
                &JobFilter {
                    state: Some(JobState::Done),
                    include_archived: true,
                    ..Default::default()
                },
                200,
                0,
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "retention listing failed");
                return 0;
            }
        };

        let mut pruned = 0;
        for job in page.jobs {
            let Ok(Some(work_dir)) = self.layout.resolve(&job.id).await else {
                continue;
            };
            for sub in prune {
                let dir = work_dir.join(sub);
                if dir.is_dir() {
                    match tokio::fs::remove_dir_all(&dir).await {
                        Ok(()) => pruned += 1,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            warn!(job = %job.id, dir = %dir.display(), error = %err, "prune failed")
                        }
                    }
                }
            }
        }

        if pruned > 0 {
            info!(count = pruned, policy = ?self.policy, "retention sweep pruned artifacts");
        }
        pruned
    }

    /// Runs until `shutdown` flips true.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_core::UserId;
    use redub_store::{InputRef, JobRecord};
    use std::path::Path;

    async fn fixture(policy: RetentionPolicy) -> (tempfile::TempDir, Arc<MetaStore>, RetentionSweeper, OutputLayout) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(
            MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
                .await
                .unwrap(),
        );
        let layout = OutputLayout::new(&dir.path().join("output")).unwrap();
        let sweeper = RetentionSweeper::new(
            meta.clone(),
            layout.clone(),
            policy,
            Duration::from_secs(60),
        );
        (dir, meta, sweeper, layout)
    }

    #[tokio::test]
    async fn balanced_prunes_working_material_only() {
        let (_dir, meta, sweeper, layout) = fixture(RetentionPolicy::Balanced).await;

        let mut job = JobRecord::new(
            UserId::new(),
            InputRef::Path {
                path: "/data/ep.mkv".into(),
            },
            serde_json::json!({}),
        );
        job.state = JobState::Done;
        meta.put_job(&job).await.unwrap();

        let work_dir = layout.prepare(&job, Path::new("/data/ep.mkv")).await.unwrap();
        tokio::fs::write(work_dir.join("audio").join("final.flac"), b"x")
            .await
            .unwrap();
        tokio::fs::write(work_dir.join("qa").join("report.json"), b"x")
            .await
            .unwrap();

        let pruned = sweeper.sweep_once().await;
        assert!(pruned >= 1);
        assert!(work_dir.join("audio").join("final.flac").exists());
        assert!(!work_dir.join("qa").exists());

        // Second sweep finds nothing new.
        assert_eq!(sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn full_policy_prunes_nothing() {
        let (_dir, meta, sweeper, layout) = fixture(RetentionPolicy::Full).await;
        let mut job = JobRecord::new(
            UserId::new(),
            InputRef::Path {
                path: "/data/ep.mkv".into(),
            },
            serde_json::json!({}),
        );
        job.state = JobState::Done;
        meta.put_job(&job).await.unwrap();
        let work_dir = layout.prepare(&job, Path::new("/data/ep.mkv")).await.unwrap();
        tokio::fs::write(work_dir.join("qa").join("report.json"), b"x")
            .await
            .unwrap();

        assert_eq!(sweeper.sweep_once().await, 0);
        assert!(work_dir.join("qa").join("report.json").exists());
    }
}
