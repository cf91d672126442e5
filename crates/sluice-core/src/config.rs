//! Pipeline configuration.
//!
//! Everything operators tune lives here: model endpoint, collection and
//! execution limits, payload caps, streaming pace, repair patch order, and
//! per-component breaker thresholds. Loadable from TOML; every section has
//! working defaults so an empty file is a valid config.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerConfig, Component};
use crate::error::CoreResult;
use crate::model::ModelConfig;
use crate::response::CollectionConfig;
use crate::sandbox::SandboxConfig;
use crate::serialize::SerializeConfig;
use crate::stream::StreamingConfig;
use crate::validation::{CodePatch, DEFAULT_PATCH_ORDER};

/// Repair behaviour of the validation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Code repair patches, applied in this order.
    pub patch_order: Vec<CodePatch>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            patch_order: DEFAULT_PATCH_ORDER.to_vec(),
        }
    }
}

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub model: ModelConfig,
    pub collection: CollectionConfig,
    pub execution: SandboxConfig,
    pub serialization: SerializeConfig,
    pub streaming: StreamingConfig,
    pub repair: RepairConfig,
    /// Per-component breaker settings; unlisted components use defaults.
    pub breakers: HashMap<Component, BreakerConfig>,
}

impl CoreConfig {
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| crate::error::CoreError::Structural {
            detail: format!("invalid config: {e}"),
        })
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.streaming.chunk_size, 24);
        assert_eq!(config.collection.max_recollect_retries, 2);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.repair.patch_order, DEFAULT_PATCH_ORDER.to_vec());
    }

    #[test]
    fn test_partial_overrides() {
        let config = CoreConfig::from_toml_str(
            r#"
            [streaming]
            chunk_size = 8
            chunk_delay_ms = 0

            [model]
            base_url = "http://model-host:9999"
            model = "alpha"
            request_timeout_ms = 1000

            [breakers.executor]
            failure_threshold = 2
            recovery_timeout_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.chunk_size, 8);
        assert_eq!(config.model.base_url, "http://model-host:9999");
        assert_eq!(
            config.breakers.get(&Component::Executor),
            Some(&BreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 100,
            })
        );
        // Untouched sections keep defaults.
        assert_eq!(config.serialization.table_row_limit, 100);
    }

    #[test]
    fn test_patch_order_is_configurable() {
        let config = CoreConfig::from_toml_str(
            r#"
            [repair]
            patch_order = ["close_brackets", "strip_trailing_continuation"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.repair.patch_order,
            vec![CodePatch::CloseBrackets, CodePatch::StripTrailingContinuation]
        );
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(CoreConfig::from_toml_str("streaming = 3").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.toml");
        std::fs::write(&path, "[streaming]\nchunk_size = 4\nchunk_delay_ms = 1\n").unwrap();
        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.streaming.chunk_size, 4);
    }
}
