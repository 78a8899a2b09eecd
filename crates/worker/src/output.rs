//! Writing collected artifacts and a run summary to disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use nodeflow_comfyui::collector::{ArtifactPayload, CollectedOutputs, OutputArtifact};
use nodeflow_comfyui::runner::JobOutcome;
use nodeflow_core::job::Job;
use serde::Serialize;

/// File name of the per-run summary.
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Serialize)]
struct RunSummary<'a> {
    job: &'a Job,
    graph_hash: &'a str,
    files: Vec<String>,
}

/// Write every artifact into `dir` as `<node_id>_<filename>`.
///
/// Raw payloads are written byte for byte; decoded bitmaps are encoded as
/// PNG. Returns the written paths in collection order.
pub fn write_artifacts(dir: &Path, artifacts: &CollectedOutputs) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut written = Vec::new();
    for artifact in artifacts.values().flatten() {
        let path = dir.join(artifact_file_name(artifact));
        match &artifact.payload {
            ArtifactPayload::Bytes(bytes) => std::fs::write(&path, bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?,
            ArtifactPayload::Bitmap(image) => image
                .save_with_format(&path, image::ImageFormat::Png)
                .with_context(|| format!("Failed to encode {}", path.display()))?,
        }
        tracing::debug!(path = %path.display(), node_id = %artifact.node_id, "Artifact written");
        written.push(path);
    }
    Ok(written)
}

/// Write [`SUMMARY_FILE`] describing the finished job.
pub fn write_summary(
    dir: &Path,
    outcome: &JobOutcome,
    files: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    let summary = RunSummary {
        job: &outcome.job,
        graph_hash: &outcome.graph_hash,
        files: files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect(),
    };
    let path = dir.join(SUMMARY_FILE);
    let json = serde_json::to_vec_pretty(&summary)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn artifact_file_name(artifact: &OutputArtifact) -> String {
    let name = match artifact.payload {
        ArtifactPayload::Bytes(_) => artifact.filename.clone(),
        ArtifactPayload::Bitmap(_) => Path::new(&artifact.filename)
            .with_extension("png")
            .to_string_lossy()
            .into_owned(),
    };
    // Server file names never carry directories, but do not trust them to.
    let name = Path::new(&name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    format!("{}_{}", artifact.node_id, name)
}
