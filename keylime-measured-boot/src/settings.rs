// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
use crate::bruteforce::DEFAULT_COMBINATION_LIMIT;
use crate::vtpm::{Locality, MAX_LOCALITY};
use config::{Config, ConfigError, Environment, File, FileFormat};
use log::*;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Prefix of the environment variables overriding the search settings,
/// e.g. `KEYLIME_MB_MAX_WORKERS=4`.
pub static ENV_PREFIX: &str = "KEYLIME_MB";

#[derive(Error, Debug)]
pub enum SettingsError {
    // Error from config crate
    #[error("Error from the config crate: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid value for '{option}': {reason}")]
    InvalidOption { option: String, reason: String },
}

/// Limits and switches of the reproduction searches.
///
/// The settings are read once and passed down by reference, they are never
/// modified by a search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// How far from its measured value the linear strategy looks for a
    /// status register value, in both directions.
    pub max_register_distance: u64,
    /// Maximum number of flipped bits tried by the combinatorial register
    /// strategy.
    pub max_register_bitflips: usize,
    /// Enables the combinatorial register strategy, which is expensive.
    pub enable_combinatorial_register: bool,
    /// Maximum number of measurements the PCR recovery may consider not
    /// performed.
    pub max_disabled_measurements: usize,
    /// Maximum number of additional event pairs the event log alignment may
    /// disable beyond the length difference of the logs.
    pub max_extra_disabled_events: usize,
    /// Localities the TPM may have been started from.
    pub localities: Vec<Locality>,
    /// Maximum number of worker threads, 0 for one per CPU.
    pub max_workers: usize,
    /// Maximum number of combinations of a single search round.
    pub combination_limit: u64,
    /// Look for the firmware image data producing unexplained digests.
    pub digest_source_search: bool,
    /// Offset step of the firmware image scan.
    pub digest_source_alignment: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            max_register_distance: 1 << 12,
            max_register_bitflips: 3,
            enable_combinatorial_register: false,
            max_disabled_measurements: 3,
            max_extra_disabled_events: 2,
            localities: vec![0, 3],
            max_workers: 0,
            combination_limit: DEFAULT_COMBINATION_LIMIT,
            digest_source_search: true,
            digest_source_alignment: 16,
        }
    }
}

impl SearchSettings {
    /// Loads the settings from the defaults, then the optional TOML file,
    /// then the `KEYLIME_MB_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        Self::build(file, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("localities")
    }

    fn build(
        file: Option<&Path>,
        environment: Environment,
    ) -> Result<Self, SettingsError> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = file {
            debug!("Loading search settings from {}", path.display());
            builder = builder.add_source(
                File::new(&path.display().to_string(), FileFormat::Toml)
                    .required(true),
            );
        }

        let settings: SearchSettings =
            builder.add_source(environment).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |option: &str, reason: String| {
            Err(SettingsError::InvalidOption {
                option: option.to_string(),
                reason,
            })
        };

        if self.max_register_bitflips > 64 {
            return invalid(
                "max_register_bitflips",
                format!(
                    "{} bits cannot be flipped in a 64 bits register",
                    self.max_register_bitflips
                ),
            );
        }
        if self.localities.is_empty() {
            return invalid(
                "localities",
                "at least one locality is required".to_string(),
            );
        }
        if let Some(locality) =
            self.localities.iter().find(|&&l| l > MAX_LOCALITY)
        {
            return invalid(
                "localities",
                format!("locality {locality} is above {MAX_LOCALITY}"),
            );
        }
        if self.combination_limit == 0 {
            return invalid(
                "combination_limit",
                "must be greater than 0".to_string(),
            );
        }
        if self.digest_source_alignment == 0 {
            return invalid(
                "digest_source_alignment",
                "must be greater than 0".to_string(),
            );
        }
        Ok(())
    }
}
