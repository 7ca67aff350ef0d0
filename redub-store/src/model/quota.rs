use serde::{Deserialize, Serialize};

use redub_core::UserId;

/// Per-user resource counters. Daily counters roll when the stored UTC day
/// differs from today's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: UserId,
    pub storage_bytes_used: u64,
    /// UTC calendar day the daily counters belong to (YYYY-MM-DD)
    pub day: String,
    pub jobs_submitted_today: u64,
    pub processing_minutes_today: u64,
    pub concurrent_running: u64,
    pub uploads_inflight: u64,
}

impl QuotaSnapshot {
    pub fn empty(user_id: UserId, day: String) -> Self {
        Self {
            user_id,
            storage_bytes_used: 0,
            day,
            jobs_submitted_today: 0,
            processing_minutes_today: 0,
            concurrent_running: 0,
            uploads_inflight: 0,
        }
    }

    /// Reset the daily window if `today` has moved past the stored day.
    pub fn roll_day(&mut self, today: &str) {
        if self.day != today {
            self.day = today.to_string();
            self.jobs_submitted_today = 0;
            self.processing_minutes_today = 0;
        }
    }
}
