//! Node graph model for ComfyUI API-format workflows.
//!
//! A workflow is an object keyed by node id, each value carrying a
//! `class_type` and an `inputs` object:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["1", 0] }
//!   }
//! }
//! ```
//!
//! Inputs are either literal scalars or references to another node's
//! output slot, encoded on the wire as `[source_node_id, slot]`.
//!
//! A [`NodeGraph`] is mutable while its owner edits it. Submission goes
//! through [`NodeGraph::snapshot`], which hands out an immutable
//! [`GraphSnapshot`] so later edits never reach an in-flight job.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bindings::ParameterBinding;
use crate::error::CoreError;
use crate::hashing::sha256_hex;
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// Input values
// ---------------------------------------------------------------------------

/// A literal input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

/// The value bound to one named input of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Output `slot` of node `node_id`. Serialized as `["<id>", slot]`.
    NodeRef(NodeId, u32),
    /// A literal number, string, or boolean.
    Scalar(Scalar),
}

impl InputValue {
    /// Build a reference to `slot` of node `node_id`.
    pub fn node_ref(node_id: impl Into<NodeId>, slot: u32) -> Self {
        Self::NodeRef(node_id.into(), slot)
    }

    /// The referenced node id, if this is a [`InputValue::NodeRef`].
    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            Self::NodeRef(id, _) => Some(id),
            Self::Scalar(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Scalar(Scalar::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Scalar(Scalar::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::Scalar(Scalar::String(value.to_string()))
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::Scalar(Scalar::String(value))
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        Self::Scalar(Scalar::Bool(value))
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        Self::Scalar(Scalar::Number(value.into()))
    }
}

impl From<u64> for InputValue {
    fn from(value: u64) -> Self {
        Self::Scalar(Scalar::Number(value.into()))
    }
}

impl TryFrom<f64> for InputValue {
    type Error = CoreError;

    /// Fails for NaN and infinities, which JSON cannot carry.
    fn try_from(value: f64) -> Result<Self, Self::Error> {
        serde_json::Number::from_f64(value)
            .map(|n| Self::Scalar(Scalar::Number(n)))
            .ok_or_else(|| CoreError::Validation(format!("{value} is not a finite number")))
    }
}

impl TryFrom<serde_json::Value> for InputValue {
    type Error = CoreError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value)?)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Editor metadata ComfyUI attaches to exported nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub title: String,
}

/// One node of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ComfyUI class type (e.g. "KSampler", "LoadImage").
    pub class_type: String,
    #[serde(default)]
    pub inputs: IndexMap<String, InputValue>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
}

impl Node {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: IndexMap::new(),
            meta: None,
        }
    }

    /// Builder-style input assignment, used when constructing graphs in code.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.meta = Some(NodeMeta {
            title: title.into(),
        });
        self
    }

    pub fn input(&self, key: &str) -> Option<&InputValue> {
        self.inputs.get(key)
    }
}

// ---------------------------------------------------------------------------
// NodeGraph
// ---------------------------------------------------------------------------

/// An ordered, editable node graph.
///
/// Iteration order is the order nodes were inserted (document order when
/// parsed from JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeGraph {
    nodes: IndexMap<NodeId, Node>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate an API-format workflow document.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let graph: Self = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Parse and validate an already-decoded workflow document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        if !value.is_object() {
            return Err(CoreError::Validation(
                "Workflow JSON must be an object".to_string(),
            ));
        }
        let graph: Self = serde_json::from_value(value)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Read a workflow document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Add a node. Fails if the id is already taken.
    pub fn insert_node(&mut self, id: impl Into<NodeId>, node: Node) -> Result<(), CoreError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(CoreError::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Nodes whose `class_type` equals `class_type`, in graph order.
    pub fn nodes_of_type<'a>(
        &'a self,
        class_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        self.nodes().filter(move |(_, node)| node.class_type == class_type)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that every node reference targets a node in this graph.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (node_id, node) in &self.nodes {
            for (input, value) in &node.inputs {
                self.check_reference(node_id, input, value)?;
            }
        }
        Ok(())
    }

    /// Overwrite existing inputs with the given bindings.
    ///
    /// A binding may only replace an input the target node already has; it
    /// never adds inputs or nodes. Every binding is checked before any is
    /// applied, so a failing patch leaves the graph untouched.
    pub fn patch<'a, I>(&mut self, bindings: I) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = &'a ParameterBinding>,
    {
        let bindings: Vec<&ParameterBinding> = bindings.into_iter().collect();

        for binding in &bindings {
            let node = self
                .nodes
                .get(&binding.node_id)
                .ok_or_else(|| CoreError::MissingNode {
                    node_id: binding.node_id.clone(),
                })?;
            if !node.inputs.contains_key(&binding.input) {
                return Err(CoreError::MissingInput {
                    node_id: binding.node_id.clone(),
                    input: binding.input.clone(),
                });
            }
            self.check_reference(&binding.node_id, &binding.input, &binding.value)?;
        }

        for binding in bindings {
            if let Some(slot) = self
                .nodes
                .get_mut(&binding.node_id)
                .and_then(|node| node.inputs.get_mut(&binding.input))
            {
                *slot = binding.value.clone();
            }
        }

        tracing::trace!(node_count = self.nodes.len(), "Graph patched");
        Ok(())
    }

    /// Deep, independent, immutable copy for submission.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot(Arc::new(self.clone()))
    }

    fn check_reference(
        &self,
        node_id: &str,
        input: &str,
        value: &InputValue,
    ) -> Result<(), CoreError> {
        match value.referenced_node() {
            Some(target) if !self.nodes.contains_key(target) => {
                Err(CoreError::DanglingReference {
                    node_id: node_id.to_string(),
                    input: input.to_string(),
                    target: target.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// GraphSnapshot
// ---------------------------------------------------------------------------

/// A frozen copy of a [`NodeGraph`] taken at submission time.
///
/// Cheap to clone; there is no way to obtain mutable access.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot(Arc<NodeGraph>);

impl GraphSnapshot {
    /// The exact JSON bytes that represent this graph on the wire.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self.0.as_ref()).expect("NodeGraph is always serialisable")
    }

    /// SHA-256 of [`to_json_bytes`](Self::to_json_bytes).
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.to_json_bytes())
    }
}

impl Deref for GraphSnapshot {
    type Target = NodeGraph;

    fn deref(&self) -> &NodeGraph {
        &self.0
    }
}

impl Serialize for GraphSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample_workflow_json() -> serde_json::Value {
        json!({
            "1": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "sd_xl_base_1.0.safetensors" }
            },
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 42,
                    "cfg": 7.5,
                    "steps": 20,
                    "model": ["1", 0],
                    "positive": ["6", 0],
                    "latent_image": ["5", 0]
                }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": { "width": 1024, "height": 1024, "batch_size": 1 }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "a beautiful landscape", "clip": ["1", 1] },
                "_meta": { "title": "Positive" }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "images": ["3", 0], "filename_prefix": "ComfyUI" }
            }
        })
    }

    fn binding(node: &str, input: &str, value: impl Into<InputValue>) -> ParameterBinding {
        ParameterBinding::new(node, input, value)
    }

    #[test]
    fn parses_scalars_and_references() {
        let graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        assert_eq!(graph.len(), 5);

        let sampler = graph.node("3").unwrap();
        assert_eq!(sampler.class_type, "KSampler");
        assert_eq!(sampler.input("seed").and_then(InputValue::as_i64), Some(42));
        assert_eq!(sampler.input("cfg").and_then(InputValue::as_f64), Some(7.5));
        assert_eq!(sampler.input("model"), Some(&InputValue::node_ref("1", 0)));
        assert_eq!(
            graph.node("6").unwrap().meta.as_ref().map(|m| m.title.as_str()),
            Some("Positive")
        );
    }

    #[test]
    fn preserves_document_order() {
        let graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let ids: Vec<&str> = graph.nodes().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["1", "3", "5", "6", "9"]);
    }

    #[test]
    fn node_refs_serialize_as_pairs() {
        let graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value["9"]["inputs"]["images"], json!(["3", 0]));
        assert_eq!(value["6"]["_meta"]["title"], "Positive");
        assert!(value["1"].get("_meta").is_none());
    }

    #[test]
    fn rejects_dangling_reference() {
        let json = r#"{"1":{"class_type":"VAEDecode","inputs":{"samples":["7",0]}}}"#;
        assert_matches!(
            NodeGraph::from_json(json),
            Err(CoreError::DanglingReference { target, .. }) if target == "7"
        );
    }

    #[test]
    fn rejects_non_object_document() {
        assert_matches!(
            NodeGraph::from_value(json!([1, 2, 3])),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut graph = NodeGraph::new();
        graph.insert_node("1", Node::new("LoadImage")).unwrap();
        assert_matches!(
            graph.insert_node("1", Node::new("SaveImage")),
            Err(CoreError::DuplicateNode(id)) if id == "1"
        );
    }

    #[test]
    fn patch_overwrites_existing_input() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        graph.patch(&[binding("3", "seed", 7_i64)]).unwrap();

        let snapshot = graph.snapshot();
        assert_eq!(
            snapshot.node("3").unwrap().input("seed").and_then(InputValue::as_i64),
            Some(7)
        );
    }

    #[test]
    fn patch_missing_input_fails() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        assert_matches!(
            graph.patch(&[binding("3", "scheduler", "karras")]),
            Err(CoreError::MissingInput { node_id, input }) if node_id == "3" && input == "scheduler"
        );
    }

    #[test]
    fn patch_missing_node_fails() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        assert_matches!(
            graph.patch(&[binding("42", "seed", 1_i64)]),
            Err(CoreError::MissingNode { node_id }) if node_id == "42"
        );
    }

    #[test]
    fn failing_patch_applies_nothing() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let before = graph.clone();

        let result = graph.patch(&[
            binding("3", "seed", 99_i64),
            binding("3", "does_not_exist", 1_i64),
        ]);

        assert!(result.is_err());
        assert_eq!(graph, before);
    }

    #[test]
    fn patch_rejects_reference_to_missing_node() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        assert_matches!(
            graph.patch(&[binding("9", "images", InputValue::node_ref("77", 0))]),
            Err(CoreError::DanglingReference { .. })
        );
    }

    #[test]
    fn snapshot_is_isolated_from_later_edits() {
        let mut graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let snapshot = graph.snapshot();

        graph.patch(&[binding("6", "text", "a stormy sea")]).unwrap();

        assert_eq!(
            snapshot.node("6").unwrap().input("text").and_then(InputValue::as_str),
            Some("a beautiful landscape")
        );
        assert_eq!(
            graph.node("6").unwrap().input("text").and_then(InputValue::as_str),
            Some("a stormy sea")
        );
    }

    #[test]
    fn identical_snapshots_hash_identically() {
        let graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let a = graph.snapshot();
        let b = graph.snapshot();
        assert_eq!(a.to_json_bytes(), b.to_json_bytes());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn nodes_of_type_filters_by_class() {
        let graph = NodeGraph::from_value(sample_workflow_json()).unwrap();
        let ids: Vec<&str> = graph.nodes_of_type("CLIPTextEncode").map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["6"]);
    }

    #[test]
    fn non_finite_float_is_rejected() {
        assert!(InputValue::try_from(f64::NAN).is_err());
        assert_eq!(
            InputValue::try_from(0.5).unwrap().as_f64(),
            Some(0.5)
        );
    }
}
