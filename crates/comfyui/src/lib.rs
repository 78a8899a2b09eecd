//! ComfyUI WebSocket and REST client library.
//!
//! Submits node graphs as jobs, tracks their progress over the ComfyUI
//! WebSocket protocol, uploads local inputs beforehand, and retrieves the
//! produced artifacts afterwards. [`runner::JobRunner`] strings the steps
//! together for callers that want the whole round trip.

pub mod api;
pub mod client;
pub mod collector;
pub mod config;
pub mod events;
pub mod messages;
pub mod runner;
pub mod tracker;
pub mod uploader;
