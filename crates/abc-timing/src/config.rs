//! Export settings: loading from TOML with an environment overlay.
//!
//! ```toml
//! [export]
//! tempo_factor = 1.25
//! meter = "3/4"
//! triplet_timing = false
//! ```
//!
//! After the file is read, `ABC_TIMING_TEMPO_FACTOR`, `ABC_TIMING_METER` and
//! `ABC_TIMING_TRIPLETS` override the corresponding values.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_cache::SequenceDataCache;
use crate::meter::TimeSignature;
use crate::{Error, Result};

pub const ENV_TEMPO_FACTOR: &str = "ABC_TIMING_TEMPO_FACTOR";
pub const ENV_METER: &str = "ABC_TIMING_METER";
pub const ENV_TRIPLETS: &str = "ABC_TIMING_TRIPLETS";

/// How a sequence is laid onto the ABC timing grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Multiplier applied to every tempo on export. 2.0 plays twice as fast.
    pub tempo_factor: f32,
    pub meter: TimeSignature,
    /// Use a triplet grid (1/3 of the normal unit) instead of a binary one.
    pub triplet_timing: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        ExportSettings {
            tempo_factor: 1.0,
            meter: TimeSignature::FOUR_FOUR,
            triplet_timing: false,
        }
    }
}

/// Where the loaded values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub files: Vec<PathBuf>,
    pub env_overrides: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    export: ExportSettings,
}

impl ExportSettings {
    /// Defaults, with the meter taken from the sequence itself.
    pub fn for_sequence(cache: &SequenceDataCache) -> Self {
        ExportSettings {
            meter: cache.time_signature(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tempo_factor.is_finite() || self.tempo_factor <= 0.0 {
            return Err(Error::Config(format!(
                "tempo_factor must be a positive number, got {}",
                self.tempo_factor
            )));
        }
        Ok(())
    }

    /// Parse the `[export]` table of a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::ConfigParse {
            path: None,
            message: e.to_string(),
        })?;
        file.export.validate()?;
        Ok(file.export)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| Error::ConfigParse {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        file.export.validate()?;
        Ok(file.export)
    }

    /// Load an optional config file on top of `base`, then apply the
    /// environment overlay.
    pub fn load(base: ExportSettings, path: Option<&Path>) -> Result<(Self, ConfigSources)> {
        let mut sources = ConfigSources::default();

        let mut settings = match path {
            Some(path) => {
                let loaded = Self::load_from_file(path)?;
                sources.files.push(path.to_path_buf());
                loaded
            }
            None => base,
        };

        sources.env_overrides = settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;

        debug!(
            tempo_factor = settings.tempo_factor,
            meter = %settings.meter,
            triplet_timing = settings.triplet_timing,
            files = sources.files.len(),
            env_overrides = sources.env_overrides.len(),
            "loaded export settings"
        );

        Ok((settings, sources))
    }

    /// Apply overrides from a key lookup (normally the process environment).
    /// Returns the names of the keys that were applied.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();

        if let Some(v) = lookup(ENV_TEMPO_FACTOR) {
            self.tempo_factor = v.trim().parse().map_err(|e| {
                Error::Config(format!("{ENV_TEMPO_FACTOR}={v} is not a number: {e}"))
            })?;
            applied.push(ENV_TEMPO_FACTOR.to_string());
        }

        if let Some(v) = lookup(ENV_METER) {
            self.meter = v.parse()?;
            applied.push(ENV_METER.to_string());
        }

        if let Some(v) = lookup(ENV_TRIPLETS) {
            self.triplet_timing = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(Error::Config(format!(
                        "{ENV_TRIPLETS}={other} is not a boolean"
                    )))
                }
            };
            applied.push(ENV_TRIPLETS.to_string());
        }

        Ok(applied)
    }
}
