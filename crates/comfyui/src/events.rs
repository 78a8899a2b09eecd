//! Typed progress events published by a running tracker.
//!
//! A tracker task publishes these on an unbounded channel in the exact
//! order the underlying frames arrived, so a presentation layer can
//! subscribe instead of being called back on the network task.

use nodeflow_core::job::JobState;
use nodeflow_core::types::JobId;
use serde::Serialize;

/// A progress event for one tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// Step `value` of `max` within the currently executing node.
    StepProgress { value: u32, max: u32 },

    /// Node `completed` (zero-based) of `total` has started or was cached.
    NodeProgress { completed: usize, total: usize },

    /// The tracker stopped. Always the last event for a job.
    Finished { job_id: JobId, state: JobState },
}

impl TrackerEvent {
    /// Completion percentage (0-100) for progress events.
    pub fn percent(&self) -> Option<u8> {
        match *self {
            Self::StepProgress { value, max } => Some(ratio_percent(value as usize, max as usize)),
            Self::NodeProgress { completed, total } => Some(ratio_percent(completed + 1, total)),
            Self::Finished { .. } => None,
        }
    }
}

fn ratio_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as f64 / total as f64) * 100.0) as u8
}
