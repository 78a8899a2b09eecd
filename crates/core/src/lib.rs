//! Domain model for remote node-graph execution.
//!
//! Holds the node graph and its immutable submission snapshots, the
//! UI-bound parameter bindings, job bookkeeping, remote-name policy for
//! uploaded inputs, and the layered configuration store the bindings are
//! persisted to. Nothing in this crate performs network I/O.

pub mod bindings;
pub mod config_store;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod job;
pub mod naming;
pub mod types;
