//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps graph submission, history retrieval, artifact download, the
//! connectivity probe, and queue control using [`reqwest`].
//!
//! Network and server failures (connection refused, non-2xx, unreadable
//! body) are logged with the URL, status, reason, and headers and turned
//! into `None`. A well-formed response that lacks a field the protocol
//! requires is a [`ProtocolError`] and is returned to the caller.

use std::time::Duration;

use indexmap::IndexMap;
use nodeflow_core::graph::GraphSnapshot;
use nodeflow_core::types::{JobId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    probe_timeout: Duration,
    span: tracing::Span,
}

/// One image listed in a node's history output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area on the server: `output`, `temp`, or `input`.
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".to_string()
}

/// Per-node output record from `/history`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    /// Present only for nodes that produce images.
    #[serde(default)]
    pub images: Option<Vec<ImageRef>>,
    /// Every other output kind (`gifs`, `text`, ...), kept raw.
    #[serde(flatten)]
    pub other: IndexMap<String, Value>,
}

/// Node id -> output record, in the order the server listed them.
pub type HistoryOutputs = IndexMap<NodeId, NodeOutput>;

/// The server's reply violated the protocol contract.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Response from {url} is missing required field '{field}'")]
    MissingField { url: String, field: &'static str },

    #[error("Response from {url} has no entry for job '{job_id}'")]
    MissingJob { url: String, job_id: JobId },

    #[error("Field '{field}' in response from {url} is malformed: {reason}")]
    MalformedField {
        url: String,
        field: &'static str,
        reason: String,
    },
}

/// Failure below the protocol layer.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    /// The HTTP request itself failed (network, DNS, TLS, body decode, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        headers: reqwest::header::HeaderMap,
        body: String,
    },
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a GraphSnapshot,
    client_id: &'a str,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across multiple instances).
    pub fn with_client(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            probe_timeout: config.probe_timeout,
            span: tracing::info_span!("comfyui_api", api_url = %config.api_url),
        }
    }

    /// Base HTTP API URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Submit a graph snapshot for execution.
    ///
    /// Sends `POST /prompt` with `{"prompt": graph, "client_id": ...}` and
    /// returns the server-assigned `prompt_id`. `Ok(None)` means the
    /// request failed and was logged.
    pub async fn submit(
        &self,
        graph: &GraphSnapshot,
        client_id: &str,
    ) -> Result<Option<JobId>, ProtocolError> {
        let url = format!("{}/prompt", self.api_url);
        let request = self.client.post(&url).json(&SubmitRequest {
            prompt: graph,
            client_id,
        });

        let doc = match fetch_json(request).await {
            Ok(doc) => doc,
            Err(e) => {
                log_transport_failure(&self.span, &url, &e);
                return Ok(None);
            }
        };

        let job_id = match doc.get("prompt_id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ProtocolError::MissingField {
                    url,
                    field: "prompt_id",
                })
            }
        };

        if let Some(node_errors) = doc
            .get("node_errors")
            .and_then(Value::as_object)
            .filter(|errors| !errors.is_empty())
        {
            tracing::warn!(
                parent: &self.span,
                job_id = %job_id,
                node_errors = %serde_json::Value::Object(node_errors.clone()),
                "Graph accepted with node errors",
            );
        }

        tracing::info!(
            parent: &self.span,
            job_id = %job_id,
            client_id,
            node_count = graph.len(),
            "Graph submitted to ComfyUI",
        );
        Ok(Some(job_id))
    }

    /// Retrieve the per-node outputs of a finished job.
    ///
    /// Sends `GET /history/{job_id}`. The response is keyed by job id and
    /// must carry an `outputs` object. `Ok(None)` means the request failed
    /// and was logged.
    pub async fn fetch_history(
        &self,
        job_id: &str,
    ) -> Result<Option<HistoryOutputs>, ProtocolError> {
        let url = format!("{}/history/{}", self.api_url, job_id);

        let mut doc = match fetch_json(self.client.get(&url)).await {
            Ok(doc) => doc,
            Err(e) => {
                log_transport_failure(&self.span, &url, &e);
                return Ok(None);
            }
        };

        let entry = doc.get_mut(job_id).ok_or_else(|| ProtocolError::MissingJob {
            url: url.clone(),
            job_id: job_id.to_string(),
        })?;

        if let Some(status) = entry
            .get("status")
            .and_then(|s| s.get("status_str"))
            .and_then(Value::as_str)
            .filter(|s| *s != "success")
        {
            tracing::warn!(parent: &self.span, job_id, status, "History reports unsuccessful run");
        }

        let outputs = entry
            .get_mut("outputs")
            .map(Value::take)
            .ok_or_else(|| ProtocolError::MissingField {
                url: url.clone(),
                field: "outputs",
            })?;

        let outputs: HistoryOutputs =
            serde_json::from_value(outputs).map_err(|e| ProtocolError::MalformedField {
                url,
                field: "outputs",
                reason: e.to_string(),
            })?;

        tracing::debug!(parent: &self.span, job_id, nodes = outputs.len(), "History fetched");
        Ok(Some(outputs))
    }

    /// Download one artifact via `GET /view`.
    ///
    /// `None` means the download failed and was logged.
    pub async fn view(&self, image: &ImageRef) -> Option<Vec<u8>> {
        let url = format!("{}/view", self.api_url);
        let request = self.client.get(&url).query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.kind.as_str()),
        ]);

        let result = match execute(request).await {
            Ok(response) => response.bytes().await.map_err(TransportError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(e) => {
                log_transport_failure(&self.span, &url, &e);
                None
            }
        }
    }

    /// Check that the server is reachable.
    ///
    /// Sends `GET /system_stats` with the configured probe timeout. This is
    /// the only call that sets an explicit timeout.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/system_stats", self.api_url);
        match execute(self.client.get(&url).timeout(self.probe_timeout)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(parent: &self.span, url, error = %e, "ComfyUI probe failed");
                false
            }
        }
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> bool {
        let url = format!("{}/interrupt", self.api_url);
        self.post_logged(&url, None).await
    }

    /// Remove a queued job (`POST /queue` with `{"delete": [job_id]}`).
    pub async fn cancel(&self, job_id: &str) -> bool {
        let url = format!("{}/queue", self.api_url);
        let body = serde_json::json!({ "delete": [job_id] });
        self.post_logged(&url, Some(&body)).await
    }

    // ---- private helpers ----

    async fn post_logged(&self, url: &str, body: Option<&Value>) -> bool {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        match execute(request).await {
            Ok(_) => true,
            Err(e) => {
                log_transport_failure(&self.span, url, &e);
                false
            }
        }
    }
}

/// Send a request and require a success status.
pub(crate) async fn execute(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, TransportError> {
    let response = request.send().await?;
    ensure_success(response).await
}

/// Send a request and decode a JSON body.
async fn fetch_json(request: reqwest::RequestBuilder) -> Result<Value, TransportError> {
    Ok(execute(request).await?.json::<Value>().await?)
}

/// Ensure the response has a success status code. Returns the response
/// unchanged on success, or a [`TransportError::Status`] with the status,
/// headers, and body text on failure.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(TransportError::Status {
            status,
            headers,
            body,
        });
    }
    Ok(response)
}

/// Log a transport failure with its diagnostic fields.
pub(crate) fn log_transport_failure(span: &tracing::Span, url: &str, err: &TransportError) {
    match err {
        TransportError::Request(e) => {
            tracing::error!(
                parent: span,
                url,
                error = %e,
                timeout = e.is_timeout(),
                connect = e.is_connect(),
                "Request to ComfyUI failed",
            );
        }
        TransportError::Status {
            status,
            headers,
            body,
        } => {
            tracing::error!(
                parent: span,
                url,
                status = status.as_u16(),
                reason = status.canonical_reason().unwrap_or("unknown"),
                headers = ?headers,
                body = %body,
                "ComfyUI returned an error status",
            );
        }
    }
}
