//! Pyramiding configuration.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::info;

use crate::models::{PyramidModel, PyramidPhase};

/// Configuration for pyramid bucketing and profit targets.
#[derive(Debug, Clone)]
pub struct PyramidConfig {
    /// Phase ladder
    pub model: PyramidModel,

    /// A buy counts as reaching a phase once price >= phase price * tolerance
    pub buy_tolerance: Decimal,

    /// Profit price as a multiple of the base phase price
    pub max_profit_level: Decimal,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            model: PyramidModel::standard(),
            buy_tolerance: dec!(0.99),    // 1% noise band below a phase price
            max_profit_level: dec!(1.15), // Take profit at +15% over base
        }
    }
}

/// On-disk form of a custom ladder. Omitted tunables keep their defaults.
#[derive(Debug, Deserialize)]
struct PyramidConfigFile {
    phases: Vec<PyramidPhase>,
    buy_tolerance: Option<Decimal>,
    max_profit_level: Option<Decimal>,
}

impl PyramidConfig {
    /// Load a custom ladder from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pyramid config {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("Invalid pyramid config {}", path.display()))?;

        info!(
            path = %path.display(),
            phases = config.model.phases().len(),
            "Loaded custom pyramid ladder"
        );
        Ok(config)
    }

    /// Parse and validate a ladder such as
    /// `{"phases": [{"name": "BASE", "shares_incremental_ratio": "0.5", ...}]}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: PyramidConfigFile = serde_json::from_str(raw)?;
        let defaults = Self::default();

        let buy_tolerance = file.buy_tolerance.unwrap_or(defaults.buy_tolerance);
        if buy_tolerance <= Decimal::ZERO || buy_tolerance > Decimal::ONE {
            bail!("buy tolerance {} must be in (0, 1]", buy_tolerance);
        }

        let max_profit_level = file.max_profit_level.unwrap_or(defaults.max_profit_level);
        if max_profit_level <= Decimal::ONE {
            bail!("max profit level {} must be above 1", max_profit_level);
        }

        Ok(Self {
            model: PyramidModel::new(file.phases)?,
            buy_tolerance,
            max_profit_level,
        })
    }
}
