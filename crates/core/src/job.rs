//! Job bookkeeping for one submitted graph.
//!
//! A [`Job`] is created once the server accepts a submission and then
//! advanced only by the progress tracker:
//!
//! ```text
//! Created -> Tracking -> Complete
//!                    \-> Failed
//! ```
//!
//! `Complete` and `Failed` are terminal.

use chrono::Utc;
use serde::Serialize;

use crate::types::{JobId, Timestamp};

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Tracking,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Raised when a transition would leave a terminal state or skip tracking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// One submitted instance of a node graph.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: JobId,
    /// Client id the progress connection is scoped to.
    pub client_id: String,
    /// Node count of the submitted snapshot; denominator for node progress.
    pub total_node_count: usize,
    pub submitted_at: Timestamp,
    state: JobState,
}

impl Job {
    pub fn new(
        job_id: impl Into<JobId>,
        client_id: impl Into<String>,
        total_node_count: usize,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            client_id: client_id.into(),
            total_node_count,
            submitted_at: Utc::now(),
            state: JobState::Created,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Advance to `to`.
    ///
    /// Allowed: `Created -> Tracking`, `Tracking -> Complete`, and
    /// `Created | Tracking -> Failed`.
    pub fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.state, to),
            (JobState::Created, JobState::Tracking)
                | (JobState::Tracking, JobState::Complete)
                | (JobState::Created | JobState::Tracking, JobState::Failed)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(job_id = %self.job_id, from = ?self.state, to = ?to, "Job state change");
        self.state = to;
        Ok(())
    }
}
