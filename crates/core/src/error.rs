use std::path::PathBuf;

/// Errors raised by the graph model, bindings, and the config store.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Node '{node_id}' does not exist in the graph")]
    MissingNode { node_id: String },

    #[error("Node '{node_id}' has no input named '{input}'")]
    MissingInput { node_id: String, input: String },

    #[error("Input '{input}' of node '{node_id}' references missing node '{target}'")]
    DanglingReference {
        node_id: String,
        input: String,
        target: String,
    },

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
