//! Progress tracking for one submitted job.
//!
//! [`ProgressTracker`] consumes the frames of a single WebSocket
//! connection, forwards step and node progress to a [`ProgressObserver`]
//! in arrival order, and drives the job to `Complete` when the server
//! reports `executing` with a null node for the tracked prompt. Every
//! other exit (closed socket, stream end, malformed frame, cancellation)
//! marks the job `Failed` and is returned as a [`TrackerError`].
//!
//! [`spawn_tracker`] runs the same loop on a background task and
//! publishes [`TrackerEvent`]s on a channel.

use futures::{Sink, SinkExt, Stream, StreamExt};
use indexmap::IndexSet;
use nodeflow_core::job::{InvalidTransition, Job, JobState};
use nodeflow_core::types::{JobId, NodeId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::events::TrackerEvent;
use crate::messages::{parse_message, MessageError, ServerMessage};

/// Receives progress in the order frames arrive.
pub trait ProgressObserver {
    /// Step `value` of `max` within the current node.
    fn step_progress(&mut self, value: u32, max: u32);

    /// Node number `completed` (zero-based) of `total` started or was cached.
    fn node_progress(&mut self, completed: usize, total: usize);
}

impl ProgressObserver for mpsc::UnboundedSender<TrackerEvent> {
    fn step_progress(&mut self, value: u32, max: u32) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(TrackerEvent::StepProgress { value, max });
    }

    fn node_progress(&mut self, completed: usize, total: usize) {
        let _ = self.send(TrackerEvent::NodeProgress { completed, total });
    }
}

/// Why tracking ended without completing the job.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The connection closed, errored, or ended before completion.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A text frame could not be decoded.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] MessageError),

    /// The caller closed the connection. `started` is set once the server
    /// began executing the prompt.
    #[error("Tracking cancelled")]
    Cancelled { started: bool },

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),

    /// The background task panicked or was aborted.
    #[error("Tracker task aborted: {0}")]
    TaskAborted(String),
}

/// State machine for one job over one connection.
pub struct ProgressTracker {
    job: Job,
    completed: IndexSet<NodeId>,
    started: bool,
    span: tracing::Span,
}

impl ProgressTracker {
    pub fn new(job: Job) -> Self {
        let span = tracing::info_span!(
            "tracker",
            job_id = %job.job_id,
            client_id = %job.client_id,
        );
        Self {
            job,
            completed: IndexSet::new(),
            started: false,
            span,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Node ids recorded as started or cached, in the order first seen.
    pub fn completed_nodes(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    /// Whether the server has started executing the tracked prompt.
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Track the job until it completes or the connection fails.
    ///
    /// The job moves to `Tracking` on entry and to `Complete` or `Failed`
    /// on exit.
    pub async fn run<S, O>(
        &mut self,
        frames: &mut S,
        observer: &mut O,
    ) -> Result<(), TrackerError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
        O: ProgressObserver + ?Sized,
    {
        self.begin()?;
        let outcome = self.listen(frames, observer).await;
        self.finish(&outcome)?;
        outcome
    }

    fn begin(&mut self) -> Result<(), TrackerError> {
        self.job.transition(JobState::Tracking)?;
        tracing::debug!(
            parent: &self.span,
            total_nodes = self.job.total_node_count,
            "Listening for progress",
        );
        Ok(())
    }

    fn finish(&mut self, outcome: &Result<(), TrackerError>) -> Result<(), TrackerError> {
        match outcome {
            Ok(()) => {
                self.job.transition(JobState::Complete)?;
                tracing::info!(
                    parent: &self.span,
                    nodes_seen = self.completed.len(),
                    "Job complete",
                );
            }
            Err(e) => {
                self.job.transition(JobState::Failed)?;
                tracing::warn!(parent: &self.span, error = %e, "Job tracking failed");
            }
        }
        Ok(())
    }

    async fn listen<S, O>(
        &mut self,
        frames: &mut S,
        observer: &mut O,
    ) -> Result<(), TrackerError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
        O: ProgressObserver + ?Sized,
    {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if self.handle_text(&text, observer)? {
                        return Ok(());
                    }
                }
                Ok(Message::Binary(payload)) => {
                    tracing::trace!(
                        parent: &self.span,
                        bytes = payload.len(),
                        "Ignoring binary message (preview image)",
                    );
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    // Handled automatically by tungstenite.
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(parent: &self.span, ?frame, "ComfyUI WebSocket closed");
                    return Err(TrackerError::ConnectionLost(
                        "server closed the connection".into(),
                    ));
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    tracing::error!(parent: &self.span, error = %e, "WebSocket receive error");
                    return Err(TrackerError::ConnectionLost(e.to_string()));
                }
            }
        }
        Err(TrackerError::ConnectionLost(
            "stream ended before the job completed".into(),
        ))
    }

    /// Apply one text frame. Returns `true` when the job is complete.
    fn handle_text<O>(&mut self, text: &str, observer: &mut O) -> Result<bool, TrackerError>
    where
        O: ProgressObserver + ?Sized,
    {
        let msg = parse_message(text).inspect_err(|e| {
            tracing::warn!(
                parent: &self.span,
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
        })?;

        match msg {
            ServerMessage::Progress(data) => {
                observer.step_progress(data.value, data.max);
            }
            ServerMessage::ExecutionCached(data) => {
                for node in data.nodes {
                    self.mark_completed(node, observer);
                }
            }
            ServerMessage::Executing(data) => match data.node {
                Some(node) => self.mark_completed(node, observer),
                None if data.prompt_id.as_deref() == Some(self.job.job_id.as_str()) => {
                    return Ok(true);
                }
                None => {
                    tracing::debug!(
                        parent: &self.span,
                        prompt_id = ?data.prompt_id,
                        "Another prompt finished",
                    );
                }
            },
            ServerMessage::ExecutionError(data) => {
                tracing::error!(
                    parent: &self.span,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
            }
            ServerMessage::Status(data) => {
                tracing::debug!(
                    parent: &self.span,
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            ServerMessage::ExecutionStart(data) => {
                if data.prompt_id == self.job.job_id {
                    self.started = true;
                }
                tracing::debug!(
                    parent: &self.span,
                    prompt_id = %data.prompt_id,
                    "Execution started",
                );
            }
            ServerMessage::Executed(data) => {
                tracing::debug!(parent: &self.span, node = %data.node, "Node executed with output");
            }
            ServerMessage::Other { kind } => {
                tracing::trace!(parent: &self.span, kind, "Ignoring message");
            }
        }
        Ok(false)
    }

    fn mark_completed<O>(&mut self, node: NodeId, observer: &mut O)
    where
        O: ProgressObserver + ?Sized,
    {
        self.started = true;
        if self.completed.insert(node) {
            observer.node_progress(self.completed.len() - 1, self.job.total_node_count);
        }
    }
}

// ---------------------------------------------------------------------------
// Background tracking
// ---------------------------------------------------------------------------

/// Handle to a tracker running on a background task.
///
/// Dropping the handle cancels the task.
pub struct TrackerHandle {
    job_id: JobId,
    task: JoinHandle<Result<Job, TrackerError>>,
    cancel: CancellationToken,
}

impl TrackerHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Close the connection. The task ends with [`TrackerError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task and return the finished job.
    pub async fn finish(mut self) -> Result<Job, TrackerError> {
        match (&mut self.task).await {
            Ok(outcome) => outcome,
            Err(e) => Err(TrackerError::TaskAborted(e.to_string())),
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Track `job` over `stream` on a new tokio task.
///
/// Progress is published on `events` in frame order, followed by exactly
/// one [`TrackerEvent::Finished`]. The connection is closed when the task
/// ends, whatever the outcome.
pub fn spawn_tracker<S>(
    job: Job,
    stream: S,
    events: mpsc::UnboundedSender<TrackerEvent>,
) -> TrackerHandle
where
    S: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static,
{
    spawn_tracker_with_cancel(job, stream, events, CancellationToken::new())
}

/// Like [`spawn_tracker`], but cancelled by `cancel` as well as the handle.
pub fn spawn_tracker_with_cancel<S>(
    job: Job,
    stream: S,
    events: mpsc::UnboundedSender<TrackerEvent>,
    cancel: CancellationToken,
) -> TrackerHandle
where
    S: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static,
{
    let job_id = job.job_id.clone();
    let task = tokio::spawn(track(job, stream, events, cancel.clone()));
    TrackerHandle {
        job_id,
        task,
        cancel,
    }
}

async fn track<S>(
    job: Job,
    mut stream: S,
    mut events: mpsc::UnboundedSender<TrackerEvent>,
    cancel: CancellationToken,
) -> Result<Job, TrackerError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut tracker = ProgressTracker::new(job);
    tracker.begin()?;

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = tracker.listen(&mut stream, &mut events) => Some(result),
    };
    let outcome = outcome.unwrap_or(Err(TrackerError::Cancelled {
        started: tracker.has_started(),
    }));

    if let Err(e) = stream.close().await {
        tracing::debug!(parent: &tracker.span, error = %e, "WebSocket already closed");
    }

    tracker.finish(&outcome)?;
    let job = tracker.into_job();
    let _ = events.send(TrackerEvent::Finished {
        job_id: job.job_id.clone(),
        state: job.state(),
    });
    outcome.map(|()| job)
}
