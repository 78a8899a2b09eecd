use std::path::PathBuf;

use clap::Parser;
use nodeflow_comfyui::runner::LocalInput;
use nodeflow_core::bindings::ParameterBinding;
use nodeflow_core::graph::InputValue;

/// Chassis used when the workflow path has no usable file stem.
const DEFAULT_CHASSIS: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a ComfyUI workflow and save its outputs", long_about = None)]
pub struct Args {
    /// API-format workflow JSON file
    #[arg(long)]
    pub workflow: PathBuf,

    /// Override an input, e.g. `3.seed=42` or `6.text="a lighthouse"`.
    /// The value is parsed as JSON and falls back to a plain string.
    #[arg(long = "set", value_name = "NODE.INPUT=VALUE", value_parser = parse_binding)]
    pub set: Vec<ParameterBinding>,

    /// Upload a local file and feed its remote name into an input
    #[arg(long = "input", value_name = "NODE.INPUT=PATH", value_parser = parse_local_input)]
    pub inputs: Vec<LocalInput>,

    /// Directory artifacts are written to
    #[arg(long, default_value = "outputs")]
    pub out: PathBuf,

    /// Name under which bindings are persisted (defaults to the workflow file stem)
    #[arg(long)]
    pub chassis: Option<String>,

    /// Decode artifacts and re-encode them as PNG
    #[arg(long)]
    pub decode: bool,

    /// Neither restore nor save bindings
    #[arg(long)]
    pub no_persist: bool,

    /// Only check that the server is reachable
    #[arg(long)]
    pub probe_only: bool,
}

impl Args {
    pub fn chassis(&self) -> String {
        self.chassis.clone().unwrap_or_else(|| {
            self.workflow
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_CHASSIS)
                .to_string()
        })
    }
}

/// Split `NODE.INPUT=VALUE` into its three parts.
///
/// The node id is everything before the last `.` of the key.
pub fn parse_assignment(raw: &str) -> Result<(String, String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NODE.INPUT=VALUE, got '{raw}'"))?;
    let (node_id, input) = key
        .rsplit_once('.')
        .ok_or_else(|| format!("expected NODE.INPUT before '=', got '{key}'"))?;
    if node_id.is_empty() || input.is_empty() {
        return Err(format!("node id and input name must be non-empty in '{raw}'"));
    }
    Ok((node_id.to_string(), input.to_string(), value.to_string()))
}

pub fn parse_binding(raw: &str) -> Result<ParameterBinding, String> {
    let (node_id, input, value) = parse_assignment(raw)?;
    let value = match serde_json::from_str::<serde_json::Value>(&value) {
        Ok(json) => InputValue::try_from(json).map_err(|e| e.to_string())?,
        Err(_) => InputValue::from(value),
    };
    Ok(ParameterBinding {
        node_id,
        input,
        value,
    })
}

pub fn parse_local_input(raw: &str) -> Result<LocalInput, String> {
    let (node_id, input, path) = parse_assignment(raw)?;
    if path.is_empty() {
        return Err(format!("missing path in '{raw}'"));
    }
    Ok(LocalInput {
        node_id,
        input,
        path: PathBuf::from(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_parts() {
        assert_eq!(
            parse_assignment("3.seed=42").unwrap(),
            ("3".to_string(), "seed".to_string(), "42".to_string())
        );
        // Values may contain '=' and '.'.
        assert_eq!(
            parse_assignment("6.text=a=b.c").unwrap().2,
            "a=b.c".to_string()
        );
    }

    #[test]
    fn malformed_assignments() {
        assert!(parse_assignment("3seed=42").is_err());
        assert!(parse_assignment("3.seed").is_err());
        assert!(parse_assignment(".seed=1").is_err());
    }

    #[test]
    fn binding_values_are_json_first() {
        assert_eq!(parse_binding("3.seed=42").unwrap().value.as_i64(), Some(42));
        assert_eq!(parse_binding("3.cfg=7.5").unwrap().value.as_f64(), Some(7.5));
        assert_eq!(parse_binding("3.add_noise=true").unwrap().value.as_bool(), Some(true));
        assert_eq!(parse_binding(r#"6.text="42""#).unwrap().value.as_str(), Some("42"));
        assert_eq!(
            parse_binding("6.text=a lighthouse").unwrap().value.as_str(),
            Some("a lighthouse")
        );
        assert_eq!(
            parse_binding(r#"3.model=["4",0]"#).unwrap().value,
            InputValue::node_ref("4", 0)
        );
    }

    #[test]
    fn object_values_are_rejected() {
        assert!(parse_binding(r#"3.seed={"a":1}"#).is_err());
    }

    #[test]
    fn chassis_defaults_to_workflow_stem() {
        let args = Args::parse_from(["nodeflow-worker", "--workflow", "flows/img2img.json"]);
        assert_eq!(args.chassis(), "img2img");

        let args = Args::parse_from([
            "nodeflow-worker",
            "--workflow",
            "flows/img2img.json",
            "--chassis",
            "portraits",
        ]);
        assert_eq!(args.chassis(), "portraits");
    }

    #[test]
    fn repeated_flags_collect() {
        let args = Args::parse_from([
            "nodeflow-worker",
            "--workflow",
            "w.json",
            "--set",
            "3.seed=1",
            "--set",
            "3.steps=30",
            "--input",
            "10.image=/tmp/canvas.png",
        ]);
        assert_eq!(args.set.len(), 2);
        assert_eq!(args.inputs[0].path, PathBuf::from("/tmp/canvas.png"));
        assert!(!args.decode);
    }
}
