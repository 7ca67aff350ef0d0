use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use redub_core::JobId;

/// In-memory cancellation signals, one per live job.
///
/// The durable half of cancellation is `JobRecord.cancel_requested`;
/// workers observe this registry for promptness and re-check the durable
/// flag at stage boundaries, so a signal lost to a restart still lands.
#[derive(Default)]
pub struct CancelRegistry {
    channels: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for a job, creating the channel on first use.
    pub fn watch(&self, job_id: &JobId) -> watch::Receiver<bool> {
        let mut channels = self.channels.lock();
        channels
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Fire the cancellation signal. A job with no channel gets one so a
    /// later subscriber still observes the request.
    pub fn signal(&self, job_id: &JobId) {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(false).0);
        let _ = tx.send(true);
    }

    /// Drop the channel once a job settles.
    pub fn clear(&self, job_id: &JobId) {
        self.channels.lock().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_existing_watcher() {
        let registry = CancelRegistry::new();
        let job = JobId::new();
        let rx = registry.watch(&job);
        assert!(!*rx.borrow());

        registry.signal(&job);
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn signal_before_watch_is_not_lost() {
        let registry = CancelRegistry::new();
        let job = JobId::new();
        registry.signal(&job);
        assert!(*registry.watch(&job).borrow());

        registry.clear(&job);
        assert!(!*registry.watch(&job).borrow());
    }
}
