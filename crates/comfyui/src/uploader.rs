//! Upload local files to the ComfyUI input area.
//!
//! Uploads go to `POST /upload/image` as a multipart form. Unless the
//! caller picks a remote name, it is derived from the local file name
//! with any uniqueness suffix stripped, so re-exports of the same asset
//! overwrite one remote file instead of piling up copies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nodeflow_core::error::CoreError;
use nodeflow_core::naming::derive_remote_name;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::api::{execute, log_transport_failure, ComfyUIApi, TransportError};

/// Storage area an upload lands in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadKind {
    #[default]
    Input,
    Temp,
    Output,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Temp => "temp",
            Self::Output => "output",
        }
    }
}

/// Per-upload settings.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Remote file name. Derived from the local path when `None`.
    pub remote_name: Option<String>,
    pub kind: UploadKind,
    pub overwrite: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            remote_name: None,
            kind: UploadKind::Input,
            overwrite: true,
        }
    }
}

impl UploadOptions {
    pub fn named(mut self, remote_name: impl Into<String>) -> Self {
        self.remote_name = Some(remote_name.into());
        self
    }

    pub fn kind(mut self, kind: UploadKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Naming(#[from] CoreError),
}

/// Server reply to a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadReceipt {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_receipt_kind")]
    pub kind: String,
}

fn default_receipt_kind() -> String {
    UploadKind::Input.as_str().to_string()
}

impl UploadReceipt {
    /// Decode an upload response body. `None` for the empty failure body
    /// or anything that is not a receipt.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        serde_json::from_slice(body).ok()
    }

    /// The value a loader node expects: `subfolder/name`, or just `name`.
    pub fn input_value(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// Pushes local blobs to the server before submission.
pub struct ArtifactUploader {
    api: Arc<ComfyUIApi>,
    span: tracing::Span,
}

impl ArtifactUploader {
    pub fn new(api: Arc<ComfyUIApi>) -> Self {
        let span = tracing::info_span!("uploader", api_url = %api.api_url());
        Self { api, span }
    }

    /// Upload `local_path` and return the raw response body.
    ///
    /// A missing or unreadable file is an [`UploadError::Io`]. Transport
    /// and server failures are logged and produce an empty body.
    pub async fn upload(
        &self,
        local_path: &Path,
        options: UploadOptions,
    ) -> Result<Vec<u8>, UploadError> {
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|source| UploadError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;

        let remote_name = match options.remote_name {
            Some(name) => name,
            None => derive_remote_name(local_path)?,
        };

        let url = format!("{}/upload/image", self.api.api_url());
        let size = contents.len();

        match self.send(&url, contents, &remote_name, options.kind, options.overwrite).await {
            Ok(body) => {
                tracing::info!(
                    parent: &self.span,
                    local_path = %local_path.display(),
                    remote_name = %remote_name,
                    kind = options.kind.as_str(),
                    bytes = size,
                    "Uploaded file",
                );
                Ok(body)
            }
            Err(e) => {
                log_transport_failure(&self.span, &url, &e);
                Ok(Vec::new())
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        contents: Vec<u8>,
        remote_name: &str,
        kind: UploadKind,
        overwrite: bool,
    ) -> Result<Vec<u8>, TransportError> {
        let image = Part::bytes(contents)
            .file_name(remote_name.to_string())
            .mime_str("image/png")?;
        let form = Form::new()
            .part("image", image)
            .text("type", kind.as_str())
            .text("overwrite", if overwrite { "true" } else { "false" });

        let response = execute(self.api.http().post(url).multipart(form)).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
