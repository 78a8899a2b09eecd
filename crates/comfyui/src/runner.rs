//! End-to-end job execution.
//!
//! [`JobRunner::run`] performs one full round trip against a ComfyUI
//! server:
//!
//! 1. patch the graph with the caller's bindings
//! 2. upload local inputs and point their loader nodes at the remote names
//! 3. connect the WebSocket, then submit a snapshot under the same client id
//! 4. track progress on a background task until the job completes
//! 5. collect the job's artifacts
//!
//! Connecting before submitting means no progress frame can arrive before
//! anyone is listening.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use nodeflow_core::bindings::{ParameterBinding, ParameterBindings};
use nodeflow_core::error::CoreError;
use nodeflow_core::graph::NodeGraph;
use nodeflow_core::job::Job;
use nodeflow_core::types::{JobId, NodeId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ProtocolError};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::collector::{CollectedOutputs, OutputCollector};
use crate::config::ClientConfig;
use crate::events::TrackerEvent;
use crate::tracker::{spawn_tracker_with_cancel, TrackerError};
use crate::uploader::{ArtifactUploader, UploadError, UploadOptions, UploadReceipt};

/// A local file to upload and feed into one node input.
#[derive(Debug, Clone)]
pub struct LocalInput {
    pub node_id: NodeId,
    pub input: String,
    pub path: PathBuf,
}

/// Everything needed for one run besides the graph.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub bindings: ParameterBindings,
    pub local_inputs: Vec<LocalInput>,
    /// Decode artifacts into bitmaps.
    pub decode: bool,
    /// Stops this run. Each request starts with a fresh token.
    pub cancel: CancellationToken,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub artifacts: CollectedOutputs,
    /// SHA-256 of the submitted graph JSON.
    pub graph_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] CoreError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Server rejected upload of {0}")]
    UploadRejected(PathBuf),

    #[error("Submission failed, see logs for the server response")]
    SubmissionFailed,

    #[error("History for job {0} is unavailable")]
    HistoryUnavailable(JobId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connect(#[from] ComfyUIClientError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Run cancelled")]
    Cancelled,
}

/// Runs graphs against one ComfyUI server.
pub struct JobRunner {
    api: Arc<ComfyUIApi>,
    client: ComfyUIClient,
    uploader: ArtifactUploader,
}

impl JobRunner {
    pub fn new(config: &ClientConfig) -> Self {
        let api = Arc::new(ComfyUIApi::new(config));
        Self {
            client: ComfyUIClient::new(config),
            uploader: ArtifactUploader::new(Arc::clone(&api)),
            api,
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Execute `graph` and collect its outputs.
    ///
    /// `graph` is patched in place with the request's bindings and the
    /// uploaded input names; the server receives an immutable snapshot.
    ///
    /// Cancelling `request.cancel` ends the run with [`RunError::Cancelled`]
    /// at whatever stage it is in. A submitted job is removed from the
    /// server queue, and interrupted only if it had started executing.
    pub async fn run(
        &self,
        graph: &mut NodeGraph,
        request: JobRequest,
        events: mpsc::UnboundedSender<TrackerEvent>,
    ) -> Result<JobOutcome, RunError> {
        let cancel = request.cancel;
        graph.patch(&request.bindings)?;
        until_cancelled(&cancel, self.upload_inputs(graph, &request.local_inputs)).await?;

        let snapshot = graph.snapshot();
        let graph_hash = snapshot.content_hash();

        let client_id = ComfyUIClient::new_client_id();
        let connection = until_cancelled(&cancel, self.client.connect(&client_id)).await?;

        // Not raced: an accepted job must never be left queued without its id.
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let job_id = self
            .api
            .submit(&snapshot, &client_id)
            .await?
            .ok_or(RunError::SubmissionFailed)?;
        if cancel.is_cancelled() {
            self.withdraw(&job_id, false).await;
            return Err(RunError::Cancelled);
        }

        let job = Job::new(job_id.clone(), client_id, snapshot.len());
        let handle =
            spawn_tracker_with_cancel(job, connection.ws_stream, events, cancel.child_token());

        let job = match handle.finish().await {
            Ok(job) => job,
            Err(TrackerError::Cancelled { started }) => {
                self.withdraw(&job_id, started).await;
                return Err(RunError::Cancelled);
            }
            Err(e) => return Err(e.into()),
        };

        let collector = OutputCollector::new(Arc::clone(&self.api)).decode(request.decode);
        let artifacts = until_cancelled(&cancel, collector.collect(&job_id))
            .await?
            .ok_or_else(|| RunError::HistoryUnavailable(job_id.clone()))?;

        tracing::info!(
            job_id = %job_id,
            graph_hash = %graph_hash,
            nodes_with_output = artifacts.len(),
            "Job finished",
        );

        Ok(JobOutcome {
            job,
            artifacts,
            graph_hash,
        })
    }

    /// Remove a cancelled job from the queue. `/interrupt` stops whatever
    /// the server is executing, so it is only sent once this job started.
    async fn withdraw(&self, job_id: &str, started: bool) {
        let dequeued = self.api.cancel(job_id).await;
        let interrupted = started && self.api.interrupt().await;
        tracing::info!(job_id, dequeued, interrupted, "Job cancelled");
    }

    async fn upload_inputs(
        &self,
        graph: &mut NodeGraph,
        inputs: &[LocalInput],
    ) -> Result<(), RunError> {
        for input in inputs {
            let body = self
                .uploader
                .upload(&input.path, UploadOptions::default())
                .await?;
            let receipt = UploadReceipt::parse(&body)
                .ok_or_else(|| RunError::UploadRejected(input.path.clone()))?;

            let binding = ParameterBinding::new(
                input.node_id.clone(),
                input.input.clone(),
                receipt.input_value(),
            );
            graph.patch([&binding])?;
        }
        Ok(())
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, RunError>
where
    F: Future<Output = Result<T, E>>,
    RunError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        result = fut => Ok(result?),
    }
}
