//! Configuration for the tracer
//!
//! Provides the flags and knobs consumed at tracer construction.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::builder::MAX_DISPLAY_PARAMETERS;

/// Tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Master switch; inactive tracing is a passthrough.
    pub active: bool,

    /// Trace instrumented LLM calls. Installing a layer is already an
    /// explicit opt-in, so this defaults to on.
    pub instrument_llm: bool,

    /// Capture recorded network calls into in-flight components.
    pub instrument_network: bool,

    /// Capture recorded user interactions into in-flight components.
    pub instrument_interactions: bool,

    /// Cap on the scalar parameters kept in the display projection.
    pub max_display_parameters: usize,

    /// Optional path to a JSON cost table loaded at construction.
    pub cost_table_path: Option<PathBuf>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            active: true,
            instrument_llm: true,
            instrument_network: false,
            instrument_interactions: false,
            max_display_parameters: MAX_DISPLAY_PARAMETERS,
            cost_table_path: None,
        }
    }
}

/// Configuration builder
pub struct TracerConfigBuilder {
    config: TracerConfig,
}

impl Default for TracerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TracerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TracerConfig::default(),
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.config.active = active;
        self
    }

    pub fn instrument_llm(mut self, enabled: bool) -> Self {
        self.config.instrument_llm = enabled;
        self
    }

    pub fn instrument_network(mut self, enabled: bool) -> Self {
        self.config.instrument_network = enabled;
        self
    }

    pub fn instrument_interactions(mut self, enabled: bool) -> Self {
        self.config.instrument_interactions = enabled;
        self
    }

    pub fn max_display_parameters(mut self, max: usize) -> Self {
        self.config.max_display_parameters = max;
        self
    }

    pub fn cost_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cost_table_path = Some(path.into());
        self
    }

    pub fn build(self) -> TracerConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> TracerConfig {
    let mut config = TracerConfig::default();

    if let Ok(active) = std::env::var("LLM_TRACE_ACTIVE") {
        config.active = active.to_lowercase() == "true" || active == "1";
    }

    if let Ok(llm) = std::env::var("LLM_TRACE_LLM") {
        config.instrument_llm = llm.to_lowercase() == "true" || llm == "1";
    }

    if let Ok(network) = std::env::var("LLM_TRACE_NETWORK") {
        config.instrument_network = network.to_lowercase() == "true" || network == "1";
    }

    if let Ok(interactions) = std::env::var("LLM_TRACE_INTERACTIONS") {
        config.instrument_interactions =
            interactions.to_lowercase() == "true" || interactions == "1";
    }

    if let Ok(max) = std::env::var("LLM_TRACE_MAX_PARAMETERS") {
        if let Ok(max) = max.parse::<usize>() {
            config.max_display_parameters = max;
        }
    }

    if let Ok(path) = std::env::var("LLM_TRACE_COST_TABLE") {
        config.cost_table_path = Some(PathBuf::from(path));
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> Result<TracerConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: TracerConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracerConfig::default();
        assert!(config.active);
        assert!(config.instrument_llm);
        assert!(!config.instrument_network);
        assert!(!config.instrument_interactions);
        assert_eq!(config.max_display_parameters, 10);
        assert!(config.cost_table_path.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = TracerConfigBuilder::new()
            .active(false)
            .instrument_network(true)
            .max_display_parameters(5)
            .cost_table_path("/etc/llm/rates.json")
            .build();

        assert!(!config.active);
        assert!(config.instrument_network);
        assert_eq!(config.max_display_parameters, 5);
        assert_eq!(
            config.cost_table_path,
            Some(PathBuf::from("/etc/llm/rates.json"))
        );
    }

    #[test]
    fn test_config_from_toml() {
        let config: TracerConfig = toml::from_str(
            r#"
            active = true
            instrument_llm = true
            instrument_network = true
            instrument_interactions = false
            max_display_parameters = 7
            "#,
        )
        .unwrap();

        assert!(config.instrument_network);
        assert_eq!(config.max_display_parameters, 7);
    }
}
