//! Layered JSON configuration store.
//!
//! The execution client only ever needs two operations from its host's
//! settings layer: "load the merged document for a chassis" and "write a
//! document for a chassis". [`ConfigStore`] captures exactly that seam.
//!
//! [`FileConfigStore`] is the on-disk implementation used by the worker
//! binary: one `<chassis>.json` per chassis under a root directory, plus
//! an optional fallback directory of shipped defaults that is read only
//! when the primary document is missing or empty.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::CoreError;

/// Maximum length of a chassis name.
const MAX_CHASSIS_NAME_LENGTH: usize = 128;

/// How a written document combines with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Discard the stored document.
    Replace,
    /// Deep-merge; the written document wins on conflicts.
    MergeOver,
    /// Deep-merge; the stored document wins on conflicts.
    MergeUnder,
}

/// Named JSON document storage.
pub trait ConfigStore {
    /// The document for `chassis`, or the fallback when the primary is
    /// missing or empty, or `{}`.
    fn load_merged(&self, chassis: &str) -> Result<Value, CoreError>;

    /// Store `document` for `chassis`, combined per `mode`.
    fn write(&self, chassis: &str, document: &Value, mode: MergeMode) -> Result<(), CoreError>;
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// anything else in `overlay` replaces the value in `base`.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Combine a stored document with an incoming one.
pub fn combine(stored: Value, incoming: &Value, mode: MergeMode) -> Value {
    match mode {
        MergeMode::Replace => incoming.clone(),
        MergeMode::MergeOver => {
            let mut out = stored;
            merge_json(&mut out, incoming);
            out
        }
        MergeMode::MergeUnder => {
            let mut out = incoming.clone();
            merge_json(&mut out, &stored);
            out
        }
    }
}

/// Chassis names become file names; restrict them accordingly.
fn is_safe_chassis_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHASSIS_NAME_LENGTH
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Directory-backed [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
    fallback_root: Option<PathBuf>,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fallback_root: None,
        }
    }

    /// Read defaults from `fallback_root` when a primary document is absent.
    pub fn with_fallback(mut self, fallback_root: impl Into<PathBuf>) -> Self {
        self.fallback_root = Some(fallback_root.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(root: &Path, chassis: &str) -> Result<PathBuf, CoreError> {
        if !is_safe_chassis_name(chassis) {
            return Err(CoreError::Validation(format!(
                "Invalid chassis name '{chassis}'"
            )));
        }
        Ok(root.join(format!("{chassis}.json")))
    }

    /// `Ok(None)` when the file does not exist or holds only whitespace.
    fn read_document(path: &Path) -> Result<Option<Value>, CoreError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn read_primary(&self, chassis: &str) -> Result<Option<Value>, CoreError> {
        Self::read_document(&Self::document_path(&self.root, chassis)?)
    }
}

impl ConfigStore for FileConfigStore {
    fn load_merged(&self, chassis: &str) -> Result<Value, CoreError> {
        if let Some(doc) = self.read_primary(chassis)? {
            if !is_empty_document(&doc) {
                return Ok(doc);
            }
        }

        if let Some(fallback_root) = &self.fallback_root {
            let path = Self::document_path(fallback_root, chassis)?;
            if let Some(doc) = Self::read_document(&path)? {
                tracing::debug!(chassis, path = %path.display(), "Using fallback config document");
                return Ok(doc);
            }
        }

        Ok(Value::Object(Map::new()))
    }

    fn write(&self, chassis: &str, document: &Value, mode: MergeMode) -> Result<(), CoreError> {
        let path = Self::document_path(&self.root, chassis)?;
        let stored = self
            .read_primary(chassis)?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let combined = combine(stored, document, mode);

        std::fs::create_dir_all(&self.root).map_err(|source| CoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        // Write beside the target and rename so readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&combined)?;
        std::fs::write(&tmp, bytes).map_err(|source| CoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| CoreError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(chassis, ?mode, "Config document written");
        Ok(())
    }
}
