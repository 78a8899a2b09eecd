/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a graph node (the string key in the workflow document).
pub type NodeId = String;

/// Server-assigned job identifier (the ComfyUI `prompt_id`).
pub type JobId = String;
