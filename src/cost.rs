//! # Cost Table
//!
//! Maps model names to per-token rates and turns token usage into a
//! [`CostBreakdown`]. The table is loaded once at tracer construction,
//! from a JSON string or file shaped like:
//!
//! ```json
//! {
//!   "gpt-4o": {"input_cost_per_token": 0.0000025, "output_cost_per_token": 0.00001}
//! }
//! ```
//!
//! A model with no entry falls back to the zero-cost default rate rather
//! than failing; an unreadable file degrades to an empty table with a
//! warning. Cost lookups never fail.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::component::{CostBreakdown, TokenUsage};
use crate::error::{Result, TraceError};

/// Per-token pricing for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelRate {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl ModelRate {
    pub fn new(input_cost_per_token: f64, output_cost_per_token: f64) -> Self {
        Self {
            input_cost_per_token,
            output_cost_per_token,
        }
    }
}

/// Model-name → rate mapping with a zero-cost fallback.
#[derive(Debug, Clone, Default)]
pub struct CostTable {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

impl CostTable {
    pub fn new(rates: HashMap<String, ModelRate>) -> Self {
        Self {
            rates,
            default_rate: ModelRate::default(),
        }
    }

    /// Parses a table from its JSON representation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let rates: HashMap<String, ModelRate> = serde_json::from_str(json)
            .map_err(|e| TraceError::CostTable(format!("invalid rate table: {e}")))?;
        Ok(Self::new(rates))
    }

    /// Reads and parses a table from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Loads from `path` when given, degrading to the empty zero-cost table
    /// when the file is missing or malformed.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::from_json_file(path).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "falling back to zero-cost table");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Rate for `model`, or the zero-cost default when unmatched.
    pub fn rate(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.default_rate)
    }

    /// Costs `usage` at the rate for `model`.
    pub fn cost_of(&self, usage: &TokenUsage, model: &str) -> CostBreakdown {
        let rate = self.rate(model);
        CostBreakdown::new(
            usage.prompt_tokens as f64 * rate.input_cost_per_token,
            usage.completion_tokens as f64 * rate.output_cost_per_token,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(model: &str, input: f64, output: f64) -> CostTable {
        let mut rates = HashMap::new();
        rates.insert(model.to_string(), ModelRate::new(input, output));
        CostTable::new(rates)
    }

    #[test]
    fn test_cost_of_known_model() {
        let table = table_with("model-x", 0.01, 0.02);
        let usage = TokenUsage::new(10, 5);

        let cost = table.cost_of(&usage, "model-x");
        assert!((cost.input_cost - 0.1).abs() < 1e-12);
        assert!((cost.output_cost - 0.1).abs() < 1e-12);
        assert!((cost.total_cost - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_unmatched_model_costs_zero() {
        let table = table_with("model-x", 0.01, 0.02);
        let usage = TokenUsage::new(1000, 1000);

        let cost = table.cost_of(&usage, "some-other-model");
        assert_eq!(cost.total_cost, 0.0);
    }

    #[test]
    fn test_from_json_str() {
        let table = CostTable::from_json_str(
            r#"{"model-x": {"input_cost_per_token": 0.01, "output_cost_per_token": 0.02}}"#,
        )
        .unwrap();
        assert_eq!(table.rate("model-x"), ModelRate::new(0.01, 0.02));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let result = CostTable::from_json_str("not json");
        assert!(matches!(result, Err(TraceError::CostTable(_))));
    }

    #[test]
    fn test_load_or_default_degrades_on_missing_file() {
        let table = CostTable::load_or_default(Some(Path::new("/nonexistent/rates.json")));
        let usage = TokenUsage::new(100, 100);
        assert_eq!(table.cost_of(&usage, "model-x").total_cost, 0.0);
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model-x": {{"input_cost_per_token": 0.5, "output_cost_per_token": 0.25}}}}"#
        )
        .unwrap();

        let table = CostTable::from_json_file(file.path()).unwrap();
        assert_eq!(table.rate("model-x"), ModelRate::new(0.5, 0.25));
    }
}
