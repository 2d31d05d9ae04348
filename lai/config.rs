//! Ensemble settings shared by the bagging sweep and the smoothing workflow.

use crate::types::{DEFAULT_SEED, ParamError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Invalid(#[from] ParamError),
}

/// `1.5, 2.0, ..., 5.0`.
pub fn default_lambda_range() -> Vec<f64> {
    (0..8).map(|i| 1.5 + 0.5 * f64::from(i)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnsembleConfig {
    /// Penalties swept by the bagging runner.
    pub lambdas: Vec<f64>,
    /// Bootstrap trials per penalty; `0` or `1` runs one trial on the
    /// unresampled references.
    pub nb_bagging: usize,
    /// Position of the confidence threshold between the lowest and highest
    /// vote count.
    pub rate_vote: f64,
    /// Similarity above which the smoothing search raises its penalty.
    pub threshold: f64,
    pub min_lambda: f64,
    pub max_lambda: f64,
    pub num_threads: usize,
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            lambdas: default_lambda_range(),
            nb_bagging: 20,
            rate_vote: 0.5,
            threshold: 0.90,
            min_lambda: 1.0,
            max_lambda: 500.0,
            num_threads: 1,
            seed: DEFAULT_SEED,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.lambdas.is_empty() {
            return Err(ParamError::EmptyLambdaRange);
        }
        for &lambda in self.lambdas.iter().chain([&self.min_lambda, &self.max_lambda]) {
            if !lambda.is_finite() || lambda < 0.0 {
                return Err(ParamError::InvalidLambda(lambda));
            }
        }
        if self.min_lambda > self.max_lambda {
            return Err(ParamError::InvertedLambdaBounds {
                min: self.min_lambda,
                max: self.max_lambda,
            });
        }
        for (name, value) in [("rate_vote", self.rate_vote), ("threshold", self.threshold)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ParamError::OutOfUnitRange { name, value });
            }
        }
        if self.num_threads == 0 {
            return Err(ParamError::NonPositiveThreads(0));
        }
        Ok(())
    }

    /// Loads and validates a TOML configuration. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_over(path, &Self::default())
    }

    /// Loads a TOML configuration whose missing keys are taken from `base`.
    pub fn load_over(path: impl AsRef<Path>, base: &Self) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let overlay: toml::Table = toml::from_str(&toml_string)?;
        let mut merged = toml::Value::try_from(base)?;
        if let toml::Value::Table(table) = &mut merged {
            for (key, value) in overlay {
                table.insert(key, value);
            }
        }
        let config: Self = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}
