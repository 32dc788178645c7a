//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::aggregate::AggregationMode;
use crate::anomaly::GateConfig;
use crate::ledger::LedgerConfig;

pub const DEFAULT_GRAD_DIM: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grad_dim: usize,
    pub gate: GateConfig,
    pub aggregation: AggregationMode,
    pub ledger: LedgerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grad_dim: DEFAULT_GRAD_DIM,
            gate: GateConfig::default(),
            aggregation: AggregationMode::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Config {
    /// Read a JSON config; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.grad_dim == 0 {
            return invalid("grad_dim must be positive");
        }

        let gate = &self.gate;
        if !gate.norm_threshold.is_finite() || gate.norm_threshold <= 0.0 {
            return invalid(format!("norm_threshold {} must be positive", gate.norm_threshold));
        }
        if !(-1.0..=1.0).contains(&gate.cosine_threshold) {
            return invalid(format!("cosine_threshold {} outside [-1, 1]", gate.cosine_threshold));
        }
        if gate.max_suspicion == 0 {
            return invalid("max_suspicion must be at least 1");
        }
        if !(gate.ema_alpha > 0.0 && gate.ema_alpha <= 1.0) {
            return invalid(format!("ema_alpha {} outside (0, 1]", gate.ema_alpha));
        }

        if let AggregationMode::TrimmedMean { trim_ratio } = self.aggregation {
            if !(0.0..0.5).contains(&trim_ratio) {
                return invalid(format!("trim_ratio {trim_ratio} outside [0, 0.5)"));
            }
        }

        let ledger = &self.ledger;
        if !(ledger.supermajority_fraction > 0.0 && ledger.supermajority_fraction <= 1.0) {
            return invalid(format!(
                "supermajority_fraction {} outside (0, 1]",
                ledger.supermajority_fraction
            ));
        }
        if !(0.0..=1.0).contains(&ledger.slash_fraction) {
            return invalid(format!("slash_fraction {} outside [0, 1]", ledger.slash_fraction));
        }
        if !ledger.default_stake.is_finite() || ledger.default_stake < 0.0 {
            return invalid(format!("default_stake {} must be non-negative", ledger.default_stake));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"grad_dim": 4, "aggregation": {"mode": "trimmed_mean", "trim_ratio": 0.2}}"#,
        )
        .unwrap();
        assert_eq!(config.grad_dim, 4);
        assert_eq!(config.aggregation, AggregationMode::TrimmedMean { trim_ratio: 0.2 });
        assert_eq!(config.gate, GateConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            Config { grad_dim: 0, ..Default::default() },
            Config { aggregation: AggregationMode::TrimmedMean { trim_ratio: 0.5 }, ..Default::default() },
            Config {
                gate: GateConfig { cosine_threshold: 1.5, ..Default::default() },
                ..Default::default()
            },
            Config {
                gate: GateConfig { max_suspicion: 0, ..Default::default() },
                ..Default::default()
            },
            Config {
                gate: GateConfig { ema_alpha: 0.0, ..Default::default() },
                ..Default::default()
            },
            Config {
                ledger: LedgerConfig { supermajority_fraction: 0.0, ..Default::default() },
                ..Default::default()
            },
            Config {
                ledger: LedgerConfig { slash_fraction: -0.1, ..Default::default() },
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/dfln.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
