//! `nodeflow-worker` -- run one ComfyUI workflow from the command line.
//!
//! # Environment variables
//!
//! | Variable                     | Default                 | Description                          |
//! |------------------------------|-------------------------|--------------------------------------|
//! | `COMFYUI_API_URL`            | `http://127.0.0.1:8188` | ComfyUI HTTP endpoint                |
//! | `COMFYUI_WS_URL`             | derived from API URL    | ComfyUI WebSocket endpoint           |
//! | `COMFYUI_PROBE_TIMEOUT_SECS` | `3`                     | Connectivity probe timeout           |
//! | `NODEFLOW_CONFIG_DIR`        | `.nodeflow`             | Where parameter bindings persist     |
//! | `NODEFLOW_LOG_FORMAT`        | `text`                  | `json` for structured log lines      |
//! | `RUST_LOG`                   | `nodeflow_worker=info,nodeflow_comfyui=info` | Log filter      |

use clap::Parser;
use nodeflow_comfyui::config::ClientConfig;
use nodeflow_comfyui::events::TrackerEvent;
use nodeflow_comfyui::runner::{JobRequest, JobRunner};
use nodeflow_core::bindings::ParameterBindings;
use nodeflow_core::config_store::FileConfigStore;
use nodeflow_core::graph::NodeGraph;
use nodeflow_worker::cli::Args;
use nodeflow_worker::output;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("NODEFLOW_LOG_FORMAT").is_ok_and(|v| v == "json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodeflow_worker=info,nodeflow_comfyui=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env()?;
    let runner = JobRunner::new(&config);

    if !runner.api().probe().await {
        anyhow::bail!("ComfyUI is not reachable at {}", config.api_url);
    }
    if args.probe_only {
        tracing::info!(api_url = %config.api_url, "ComfyUI is reachable");
        return Ok(());
    }

    let mut graph = NodeGraph::load(&args.workflow)?;
    let store = FileConfigStore::new(&config.config_dir);
    let chassis = args.chassis();

    let mut bindings = if args.no_persist {
        ParameterBindings::new()
    } else {
        ParameterBindings::restore(&store, &chassis)?.applicable_to(&graph)
    };
    for binding in &args.set {
        bindings.set(binding.node_id.clone(), binding.input.clone(), binding.value.clone());
    }

    tracing::info!(
        workflow = %args.workflow.display(),
        chassis = %chassis,
        nodes = graph.len(),
        bindings = bindings.len(),
        uploads = args.inputs.len(),
        "Starting run",
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(report_progress(event_rx));

    let request = JobRequest {
        bindings: bindings.clone(),
        local_inputs: args.inputs.clone(),
        decode: args.decode,
        ..JobRequest::default()
    };
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling job");
            cancel.cancel();
        }
    });

    let outcome = runner.run(&mut graph, request, event_tx).await;
    let _ = progress.await;
    let outcome = outcome?;

    let files = output::write_artifacts(&args.out, &outcome.artifacts)?;
    let summary = output::write_summary(&args.out, &outcome, &files)?;

    if !args.no_persist {
        bindings.save(&store, &chassis)?;
    }

    tracing::info!(
        job_id = %outcome.job.job_id,
        artifacts = files.len(),
        summary = %summary.display(),
        "Run complete",
    );
    Ok(())
}

/// Log tracker events until the channel closes.
async fn report_progress(mut events: mpsc::UnboundedReceiver<TrackerEvent>) {
    while let Some(event) = events.recv().await {
        let percent = event.percent();
        match event {
            TrackerEvent::StepProgress { value, max } => {
                tracing::debug!(value, max, percent, "Step progress");
            }
            TrackerEvent::NodeProgress { completed, total } => {
                tracing::info!(node = completed + 1, total, percent, "Node progress");
            }
            TrackerEvent::Finished { job_id, state } => {
                tracing::info!(job_id = %job_id, state = ?state, "Tracking finished");
            }
        }
    }
}
