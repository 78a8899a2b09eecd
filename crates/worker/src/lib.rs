//! Command-line front end for running ComfyUI workflows.
//!
//! The `nodeflow-worker` binary loads an API-format workflow, applies
//! persisted and command-line parameter overrides, uploads local inputs,
//! runs the job, and writes the resulting artifacts to disk.

pub mod cli;
pub mod output;
