//! The dispatch unit consumed by workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queued task waiting for a worker.
///
/// Invariant: at most one unconsumed entry exists per task at any time.
/// The entry is deleted once its task reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub id: u64,
    pub task_id: u64,
    pub priority: u8,
    /// Earliest dispatch time; `None` means immediately eligible
    pub eta: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    /// Set while a worker is executing the task
    pub locked: bool,
}

impl QueuedEntry {
    pub fn new(task_id: u64, priority: u8) -> Self {
        Self {
            id: 0,
            task_id,
            priority,
            eta: None,
            created: Utc::now(),
            locked: false,
        }
    }

    /// Whether a worker may pick this entry up now
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.locked && self.eta.map(|eta| eta < now).unwrap_or(true)
    }
}
