//! Integration tests for bindings persistence through `FileConfigStore`
//! and for loading workflows from disk.

use assert_matches::assert_matches;
use nodeflow_core::bindings::{ParameterBindings, BINDINGS_KEY};
use nodeflow_core::config_store::{ConfigStore, FileConfigStore, MergeMode};
use nodeflow_core::error::CoreError;
use nodeflow_core::graph::NodeGraph;
use serde_json::json;

const WORKFLOW: &str = r#"{
    "3": { "class_type": "KSampler", "inputs": { "seed": 1, "cfg": 7.0, "steps": 20 } },
    "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } }
}"#;

// ---------------------------------------------------------------------------
// Test: bindings survive a save/restore cycle
// ---------------------------------------------------------------------------

#[test]
fn bindings_round_trip_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path());

    let mut bindings = ParameterBindings::new();
    bindings.set("3", "seed", 42i64);
    bindings.set("6", "text", "harbor at dusk");
    bindings.save(&store, "img2img").unwrap();

    let restored = ParameterBindings::restore(&store, "img2img").unwrap();
    assert_eq!(restored.get("3", "seed").and_then(|v| v.as_i64()), Some(42));
    assert_eq!(restored.get("6", "text").and_then(|v| v.as_str()), Some("harbor at dusk"));
    assert!(dir.path().join("img2img.json").exists());
}

// ---------------------------------------------------------------------------
// Test: saving bindings keeps the rest of the chassis document
// ---------------------------------------------------------------------------

#[test]
fn save_preserves_other_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path());
    store
        .write("img2img", &json!({ "window": { "width": 640 } }), MergeMode::Replace)
        .unwrap();

    let mut bindings = ParameterBindings::new();
    bindings.set("3", "steps", 30i64);
    bindings.save(&store, "img2img").unwrap();

    let doc = store.load_merged("img2img").unwrap();
    assert_eq!(doc["window"]["width"], 640);
    assert_eq!(doc[BINDINGS_KEY]["3"]["steps"], 30);
}

#[test]
fn removed_bindings_stay_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path());

    let mut bindings = ParameterBindings::new();
    bindings.set("3", "seed", 1i64);
    bindings.set("3", "steps", 20i64);
    bindings.save(&store, "txt2img").unwrap();

    bindings.remove("3", "seed");
    bindings.save(&store, "txt2img").unwrap();

    let restored = ParameterBindings::restore(&store, "txt2img").unwrap();
    assert!(restored.get("3", "seed").is_none());
    assert_eq!(restored.len(), 1);
}

// ---------------------------------------------------------------------------
// Test: fallback documents
// ---------------------------------------------------------------------------

#[test]
fn fallback_used_only_when_primary_missing_or_empty() {
    let primary = tempfile::tempdir().unwrap();
    let defaults = tempfile::tempdir().unwrap();
    std::fs::write(
        defaults.path().join("img2img.json"),
        r#"{ "bindings": { "3": { "steps": 12 } } }"#,
    )
    .unwrap();
    let store = FileConfigStore::new(primary.path()).with_fallback(defaults.path());

    let restored = ParameterBindings::restore(&store, "img2img").unwrap();
    assert_eq!(restored.get("3", "steps").and_then(|v| v.as_i64()), Some(12));

    std::fs::write(primary.path().join("img2img.json"), "{}").unwrap();
    let restored = ParameterBindings::restore(&store, "img2img").unwrap();
    assert_eq!(restored.get("3", "steps").and_then(|v| v.as_i64()), Some(12));

    let mut bindings = ParameterBindings::new();
    bindings.set("3", "steps", 40i64);
    bindings.save(&store, "img2img").unwrap();
    let restored = ParameterBindings::restore(&store, "img2img").unwrap();
    assert_eq!(restored.get("3", "steps").and_then(|v| v.as_i64()), Some(40));
}

#[test]
fn unknown_chassis_restores_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path());

    assert!(ParameterBindings::restore(&store, "never-saved").unwrap().is_empty());
}

#[test]
fn unsafe_chassis_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileConfigStore::new(dir.path());

    assert_matches!(
        store.load_merged("../escape"),
        Err(CoreError::Validation(_))
    );
}

// ---------------------------------------------------------------------------
// Test: restored bindings applied to a workflow loaded from disk
// ---------------------------------------------------------------------------

#[test]
fn restored_bindings_patch_loaded_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_path = dir.path().join("workflow_api.json");
    std::fs::write(&workflow_path, WORKFLOW).unwrap();
    let store = FileConfigStore::new(dir.path().join("config"));

    let mut bindings = ParameterBindings::new();
    bindings.set("3", "seed", 1234i64);
    // Recorded against an older workflow revision.
    bindings.set("8", "vae_name", "legacy.pt");
    bindings.save(&store, "txt2img").unwrap();

    let mut graph = NodeGraph::load(&workflow_path).unwrap();
    let restored = ParameterBindings::restore(&store, "txt2img").unwrap();

    assert_matches!(graph.patch(&restored), Err(CoreError::MissingNode { .. }));

    let applicable = restored.applicable_to(&graph);
    graph.patch(&applicable).unwrap();
    assert_eq!(graph.node("3").unwrap().input("seed").unwrap().as_i64(), Some(1234));
}

#[test]
fn loading_missing_workflow_is_io_error() {
    assert_matches!(
        NodeGraph::load("/nonexistent/workflow.json"),
        Err(CoreError::Io { .. })
    );
}
