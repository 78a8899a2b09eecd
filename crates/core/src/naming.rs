//! Remote naming convention for uploaded input files.
//!
//! Collaborators that export temporary files (canvas crops, masks) give
//! them unique local names so they never clobber each other on disk. On
//! the server, however, repeated uploads of the same logical asset should
//! overwrite one remote file rather than pile up. [`derive_remote_name`]
//! strips the uniqueness suffix back off.
//!
//! Recognized suffixes, stripped repeatedly from the end of the stem:
//!
//! - `_<uuid>` (hyphenated)
//! - `_<8 or more hex digits>`, which also covers `_<unix timestamp>`
//! - ` (<n>)`, the desktop "duplicate copy" marker

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;

static UNIQUENESS_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:_(?:[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}|[0-9a-f]{8,})| \(\d+\))+$",
    )
    .expect("valid regex")
});

/// Length of the hex suffix appended by [`unique_name`].
const UNIQUE_SUFFIX_LEN: usize = 8;

/// Remove any uniqueness suffix from a file stem.
///
/// Returns the stem unchanged if stripping would leave it empty.
pub fn strip_uniqueness_suffix(stem: &str) -> &str {
    match UNIQUENESS_SUFFIX_RE.find(stem) {
        Some(m) if m.start() > 0 => &stem[..m.start()],
        _ => stem,
    }
}

/// Derive the server-side name for a local file.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use nodeflow_core::naming::derive_remote_name;
///
/// assert_eq!(derive_remote_name(Path::new("/tmp/mask_3fa85f64.png")).unwrap(), "mask.png");
/// assert_eq!(derive_remote_name(Path::new("layer (2).png")).unwrap(), "layer.png");
/// assert_eq!(derive_remote_name(Path::new("final_0.png")).unwrap(), "final_0.png");
/// ```
pub fn derive_remote_name(path: &Path) -> Result<String, CoreError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Cannot derive a remote name from '{}'",
                path.display()
            ))
        })?;

    let base = strip_uniqueness_suffix(stem);
    Ok(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    })
}

/// Generate a unique local file name `{stem}_{8 hex}.{ext}`.
///
/// [`derive_remote_name`] maps every name produced here back to
/// `{stem}.{ext}`.
pub fn unique_name(stem: &str, ext: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{stem}_{}.{ext}", &id[..UNIQUE_SUFFIX_LEN])
}
