//! Client configuration
//!
//! JSON documents with camelCase keys. Several documents can be layered:
//! nested objects merge key by key, everything else is replaced by the later
//! layer. Missing keys fall back to the defaults below.
//!
//! ```json
//! {
//!   "host": "10.0.0.5",
//!   "port": 4712,
//!   "configFile": "d:/tebis/Anlage/Config.txt",
//!   "liveValues": { "enable": true, "offsetMstId": 100025 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::planner::MAX_POINTS_PER_REQUEST;
use crate::transport::DEFAULT_PORT;

pub const DEFAULT_CONFIG_FILE: &str = "d:/tebis/Anlage/Config.txt";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub port: u16,
    /// Server-side configuration file named in every request
    pub config_file: String,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub batch_size: usize,
    pub live_values: LiveValuesConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            connect_timeout_ms: None,
            read_timeout_ms: None,
            batch_size: MAX_POINTS_PER_REQUEST,
            live_values: LiveValuesConfig::default(),
        }
    }
}

/// Clock-offset estimation for reading current values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveValuesConfig {
    pub enable: bool,
    /// Seconds between offset estimates
    pub recalc_time_offset_every: u64,
    /// Point whose latest sample stands in for the server's "now"
    pub offset_mst_id: i64,
}

impl Default for LiveValuesConfig {
    fn default() -> Self {
        Self {
            enable: false,
            recalc_time_offset_every: 600,
            offset_mst_id: 100_025,
        }
    }
}

impl ClientConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Deep-merge JSON layers left to right, then fill the gaps with defaults.
    pub fn from_layers<I>(layers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = JsonValue>,
    {
        let mut merged = JsonValue::Object(Default::default());
        for layer in layers {
            merge_json(&mut merged, layer);
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// Merge `delta` into `base`: objects recursively, anything else replaces.
pub fn merge_json(base: &mut JsonValue, delta: JsonValue) {
    match (base, delta) {
        (JsonValue::Object(base), JsonValue::Object(delta)) => {
            for (key, value) in delta {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, delta) => *base = delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_to_empty_document() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.port, 4712);
        assert_eq!(config.config_file, "d:/tebis/Anlage/Config.txt");
        assert!(!config.live_values.enable);
        assert_eq!(config.live_values.recalc_time_offset_every, 600);
        assert_eq!(config.live_values.offset_mst_id, 100_025);
    }

    #[test]
    fn layers_merge_nested_objects() {
        let config = ClientConfig::from_layers([
            json!({"host": "a", "liveValues": {"enable": true, "offsetMstId": 1}}),
            json!({"host": "b", "liveValues": {"offsetMstId": 2}}),
        ])
        .unwrap();
        assert_eq!(config.host.as_deref(), Some("b"));
        assert!(config.live_values.enable);
        assert_eq!(config.live_values.offset_mst_id, 2);
        assert_eq!(config.live_values.recalc_time_offset_every, 600);
    }

    #[test]
    fn scalars_and_arrays_replace() {
        let mut base = json!({"a": [1, 2], "b": {"c": 1}});
        merge_json(&mut base, json!({"a": [3], "b": 5}));
        assert_eq!(base, json!({"a": [3], "b": 5}));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let err = ClientConfig::from_json(r#"{"port": "x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn missing_file_names_path() {
        let err = ClientConfig::from_file("/nonexistent/tebis.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tebis.json"));
    }
}
