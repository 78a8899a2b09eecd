//! UI-bound parameter values and their persistence.
//!
//! A [`ParameterBindings`] set is built per editing session. Each user
//! edit records one `(node_id, input) -> value` entry; immediately before
//! submission the set is flushed into the graph with
//! [`NodeGraph::patch`](crate::graph::NodeGraph::patch). The same set is
//! written to a [`ConfigStore`] chassis so the next session starts from
//! the last used values.
//!
//! Persisted shape, under the `bindings` key of the chassis document:
//!
//! ```json
//! { "bindings": { "3": { "seed": 42, "cfg": 7.5 }, "6": { "text": "..." } } }
//! ```

use serde_json::{Map, Value};

use crate::config_store::{ConfigStore, MergeMode};
use crate::error::CoreError;
use crate::graph::{InputValue, NodeGraph};
use crate::types::NodeId;

/// Key under which bindings live inside a chassis document.
pub const BINDINGS_KEY: &str = "bindings";

/// A single `(node_id, input) -> value` assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    pub node_id: NodeId,
    pub input: String,
    pub value: InputValue,
}

impl ParameterBinding {
    pub fn new(
        node_id: impl Into<NodeId>,
        input: impl Into<String>,
        value: impl Into<InputValue>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            input: input.into(),
            value: value.into(),
        }
    }
}

/// Ordered set of bindings, at most one per `(node_id, input)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBindings {
    entries: Vec<ParameterBinding>,
}

impl ParameterBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value, replacing any earlier value for the same input.
    pub fn set(
        &mut self,
        node_id: impl Into<NodeId>,
        input: impl Into<String>,
        value: impl Into<InputValue>,
    ) {
        let binding = ParameterBinding::new(node_id, input, value);
        match self
            .entries
            .iter_mut()
            .find(|b| b.node_id == binding.node_id && b.input == binding.input)
        {
            Some(existing) => existing.value = binding.value,
            None => self.entries.push(binding),
        }
    }

    pub fn get(&self, node_id: &str, input: &str) -> Option<&InputValue> {
        self.entries
            .iter()
            .find(|b| b.node_id == node_id && b.input == input)
            .map(|b| &b.value)
    }

    pub fn remove(&mut self, node_id: &str, input: &str) -> Option<InputValue> {
        let idx = self
            .entries
            .iter()
            .position(|b| b.node_id == node_id && b.input == input)?;
        Some(self.entries.remove(idx).value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParameterBinding> {
        self.entries.iter()
    }

    /// Keep only bindings whose node and input exist in `graph`.
    ///
    /// Persisted values can outlive the workflow they were recorded
    /// against; stale entries are dropped instead of failing the patch.
    pub fn applicable_to(&self, graph: &NodeGraph) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|b| {
                let applies = graph
                    .node(&b.node_id)
                    .is_some_and(|node| node.inputs.contains_key(&b.input));
                if !applies {
                    tracing::debug!(
                        node_id = %b.node_id,
                        input = %b.input,
                        "Dropping binding that does not apply to this graph",
                    );
                }
                applies
            })
            .cloned()
            .collect();
        Self { entries }
    }

    /// Encode as `{ node_id: { input: value } }`.
    pub fn to_document(&self) -> Value {
        let mut nodes = Map::new();
        for b in &self.entries {
            let inputs = nodes
                .entry(b.node_id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inputs) = inputs {
                inputs.insert(
                    b.input.clone(),
                    serde_json::to_value(&b.value).expect("InputValue is always serialisable"),
                );
            }
        }
        Value::Object(nodes)
    }

    /// Decode the shape produced by [`to_document`](Self::to_document).
    pub fn from_document(doc: &Value) -> Result<Self, CoreError> {
        let nodes = doc.as_object().ok_or_else(|| {
            CoreError::Validation("Bindings document must be an object".to_string())
        })?;

        let mut bindings = Self::new();
        for (node_id, inputs) in nodes {
            let inputs = inputs.as_object().ok_or_else(|| {
                CoreError::Validation(format!("Bindings for node '{node_id}' must be an object"))
            })?;
            for (input, value) in inputs {
                bindings.set(node_id.clone(), input.clone(), InputValue::try_from(value.clone())?);
            }
        }
        Ok(bindings)
    }

    /// Persist under [`BINDINGS_KEY`] of `chassis`, leaving other keys intact.
    pub fn save(&self, store: &dyn ConfigStore, chassis: &str) -> Result<(), CoreError> {
        let mut doc = store.load_merged(chassis)?;
        if !doc.is_object() {
            doc = Value::Object(Map::new());
        }
        // The bindings object is replaced wholesale so removed entries stay removed.
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(BINDINGS_KEY.to_string(), self.to_document());
        }
        store.write(chassis, &doc, MergeMode::Replace)?;
        tracing::debug!(chassis, count = self.len(), "Parameter bindings saved");
        Ok(())
    }

    /// Load the bindings last saved to `chassis`, or an empty set.
    pub fn restore(store: &dyn ConfigStore, chassis: &str) -> Result<Self, CoreError> {
        let doc = store.load_merged(chassis)?;
        match doc.get(BINDINGS_KEY) {
            Some(bindings) => Self::from_document(bindings),
            None => Ok(Self::new()),
        }
    }
}

impl<'a> IntoIterator for &'a ParameterBindings {
    type Item = &'a ParameterBinding;
    type IntoIter = std::slice::Iter<'a, ParameterBinding>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
