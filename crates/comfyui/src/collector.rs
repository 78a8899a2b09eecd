//! Retrieve the artifacts of a completed job.
//!
//! The collector reads `/history/{job_id}`, walks every node that lists
//! images, and downloads each one through `/view`. Server-side scratch
//! files are skipped by name. A failed download or decode drops that one
//! artifact and the rest of the batch carries on.

use std::sync::Arc;

use image::DynamicImage;
use indexmap::IndexMap;
use nodeflow_core::types::NodeId;

use crate::api::{ComfyUIApi, ImageRef, ProtocolError};

/// Filename substrings marking server-side temporary files.
pub const TRANSIENT_MARKERS: &[&str] = &["temporary_trash", "_temp_"];

/// Whether `filename` names a transient artifact (case-insensitive).
pub fn is_transient(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub enum ArtifactPayload {
    /// The bytes exactly as served.
    Bytes(Vec<u8>),
    /// Decoded pixels.
    Bitmap(DynamicImage),
}

/// One downloaded output image.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub node_id: NodeId,
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
    pub payload: ArtifactPayload,
}

impl OutputArtifact {
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            ArtifactPayload::Bytes(bytes) => Some(bytes),
            ArtifactPayload::Bitmap(_) => None,
        }
    }

    pub fn bitmap(&self) -> Option<&DynamicImage> {
        match &self.payload {
            ArtifactPayload::Bitmap(image) => Some(image),
            ArtifactPayload::Bytes(_) => None,
        }
    }
}

/// Node id -> artifacts, in history order.
pub type CollectedOutputs = IndexMap<NodeId, Vec<OutputArtifact>>;

pub struct OutputCollector {
    api: Arc<ComfyUIApi>,
    decode: bool,
    span: tracing::Span,
}

impl OutputCollector {
    pub fn new(api: Arc<ComfyUIApi>) -> Self {
        let span = tracing::info_span!("collector", api_url = %api.api_url());
        Self {
            api,
            decode: false,
            span,
        }
    }

    /// Decode downloads into bitmaps instead of returning raw bytes.
    pub fn decode(mut self, decode: bool) -> Self {
        self.decode = decode;
        self
    }

    /// Fetch every non-transient image of `job_id`.
    ///
    /// Call only after the job's tracker reported completion. `Ok(None)`
    /// means the history request itself failed and was logged.
    pub async fn collect(&self, job_id: &str) -> Result<Option<CollectedOutputs>, ProtocolError> {
        let Some(history) = self.api.fetch_history(job_id).await? else {
            tracing::warn!(parent: &self.span, job_id, "No history available, nothing collected");
            return Ok(None);
        };

        let mut collected = CollectedOutputs::new();
        for (node_id, output) in history {
            if !output.other.is_empty() {
                tracing::debug!(
                    parent: &self.span,
                    job_id,
                    node_id = %node_id,
                    kinds = ?output.other.keys().collect::<Vec<_>>(),
                    "Skipping non-image outputs",
                );
            }
            let Some(images) = output.images else {
                continue;
            };

            let mut artifacts = Vec::with_capacity(images.len());
            for image in images {
                if let Some(artifact) = self.fetch_one(&node_id, image).await {
                    artifacts.push(artifact);
                }
            }
            collected.insert(node_id, artifacts);
        }

        tracing::info!(
            parent: &self.span,
            job_id,
            nodes = collected.len(),
            artifacts = collected.values().map(Vec::len).sum::<usize>(),
            "Outputs collected",
        );
        Ok(Some(collected))
    }

    async fn fetch_one(&self, node_id: &str, image: ImageRef) -> Option<OutputArtifact> {
        if is_transient(&image.filename) {
            tracing::debug!(
                parent: &self.span,
                node_id,
                filename = %image.filename,
                "Skipping transient artifact",
            );
            return None;
        }

        let Some(bytes) = self.api.view(&image).await else {
            tracing::warn!(
                parent: &self.span,
                node_id,
                filename = %image.filename,
                "Dropping artifact that could not be downloaded",
            );
            return None;
        };

        let payload = if self.decode {
            match image::load_from_memory(&bytes) {
                Ok(bitmap) => ArtifactPayload::Bitmap(bitmap),
                Err(e) => {
                    tracing::warn!(
                        parent: &self.span,
                        node_id,
                        filename = %image.filename,
                        error = %e,
                        "Dropping artifact that could not be decoded",
                    );
                    return None;
                }
            }
        } else {
            ArtifactPayload::Bytes(bytes)
        };

        Some(OutputArtifact {
            node_id: node_id.to_string(),
            filename: image.filename,
            subfolder: image.subfolder,
            kind: image.kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_match_case_insensitively() {
        assert!(is_transient("temporary_trash_0.png"));
        assert!(is_transient("ComfyUI_TEMP_abcd_00001_.png"));
        assert!(!is_transient("final_0.png"));
        assert!(!is_transient("temperature.png"));
    }

    #[test]
    fn payload_accessors() {
        let artifact = OutputArtifact {
            node_id: "9".into(),
            filename: "final_0.png".into(),
            subfolder: String::new(),
            kind: "output".into(),
            payload: ArtifactPayload::Bytes(vec![1, 2, 3]),
        };
        assert_eq!(artifact.bytes(), Some(&[1u8, 2, 3][..]));
        assert!(artifact.bitmap().is_none());
    }
}
