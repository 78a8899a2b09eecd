//! Connection settings for a ComfyUI server, read from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Default timeout for the connectivity probe.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;

/// Default directory for persisted chassis documents.
pub const DEFAULT_CONFIG_DIR: &str = ".nodeflow";

/// Connection settings for one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://host:8188`.
    pub ws_url: String,
    /// Timeout applied to [`probe`](crate::api::ComfyUIApi::probe) only.
    pub probe_timeout: Duration,
    /// Root of the [`FileConfigStore`](nodeflow_core::config_store::FileConfigStore).
    pub config_dir: PathBuf,
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl ClientConfig {
    /// Settings for `api_url` with every other field defaulted.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                          |
    /// |------------------------------|----------------------------------|
    /// | `COMFYUI_API_URL`            | `http://127.0.0.1:8188`          |
    /// | `COMFYUI_WS_URL`             | derived from `COMFYUI_API_URL`   |
    /// | `COMFYUI_PROBE_TIMEOUT_SECS` | `3`                              |
    /// | `NODEFLOW_CONFIG_DIR`        | `.nodeflow`                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = std::env::var("COMFYUI_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "COMFYUI_API_URL",
                expected: "an http:// or https:// URL",
                value: api_url,
            });
        }
        let mut config = Self::new(api_url);

        if let Ok(ws_url) = std::env::var("COMFYUI_WS_URL") {
            config.ws_url = ws_url.trim_end_matches('/').to_string();
        }

        if let Ok(raw) = std::env::var("COMFYUI_PROBE_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                var: "COMFYUI_PROBE_TIMEOUT_SECS",
                expected: "a whole number of seconds",
                value: raw.clone(),
            })?;
            config.probe_timeout = Duration::from_secs(secs);
        }

        if let Ok(dir) = std::env::var("NODEFLOW_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

/// `http://` -> `ws://`, `https://` -> `wss://`.
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}
