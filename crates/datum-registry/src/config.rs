//! Registry connection settings.
//!
//! Settings come from the process environment so deployments can point a
//! registry at a different dimension configuration without code changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use datum_core::{DimensionConfig, Error, LogFormat, Result};

const ENV_WRITEABLE: &str = "DATUM_REGISTRY_WRITEABLE";
const ENV_LOG_FORMAT: &str = "DATUM_LOG_FORMAT";
const ENV_DIMENSION_CONFIG: &str = "DATUM_DIMENSION_CONFIG";

/// How to open a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Whether the connection accepts writes.
    pub writeable: bool,
    /// Log output format.
    pub log_format: LogFormat,
    /// Dimension configuration used when creating a new registry; the
    /// bundled standard configuration when unset.
    pub dimension_config: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            writeable: true,
            log_format: LogFormat::default(),
            dimension_config: None,
        }
    }
}

impl RegistryConfig {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads settings with a custom environment source.
    ///
    /// Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a value cannot be parsed.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let writeable = match get_env(ENV_WRITEABLE) {
            Some(raw) => parse_bool(ENV_WRITEABLE, &raw)?,
            None => defaults.writeable,
        };
        let log_format = match get_env(ENV_LOG_FORMAT) {
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "{ENV_LOG_FORMAT} must be 'json' or 'pretty', got '{raw}'"
                ))
            })?,
            None => defaults.log_format,
        };
        let dimension_config = get_env(ENV_DIMENSION_CONFIG)
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self {
            writeable,
            log_format,
            dimension_config,
        })
    }

    /// Reads the configured dimension configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn load_dimensions(&self) -> Result<DimensionConfig> {
        match &self.dimension_config {
            Some(path) => DimensionConfig::from_path(path),
            None => DimensionConfig::standard(),
        }
    }

    /// Installs the process-wide subscriber in the configured format.
    ///
    /// Only the first call in a process has any effect.
    pub fn init_logging(&self) {
        datum_core::init_logging(self.log_format);
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = RegistryConfig::from_env_with(env(&[])).unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert!(config.writeable);
    }

    #[test]
    fn values_are_read() {
        let config = RegistryConfig::from_env_with(env(&[
            (ENV_WRITEABLE, "off"),
            (ENV_LOG_FORMAT, "JSON"),
            (ENV_DIMENSION_CONFIG, "/etc/datum/dimensions.json"),
        ]))
        .unwrap();
        assert!(!config.writeable);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.dimension_config,
            Some(PathBuf::from("/etc/datum/dimensions.json"))
        );
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = RegistryConfig::from_env_with(env(&[(ENV_WRITEABLE, "maybe")])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = RegistryConfig::from_env_with(env(&[(ENV_LOG_FORMAT, "xml")])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn standard_dimensions_load_without_a_path() {
        let config = RegistryConfig::default();
        assert!(config.load_dimensions().unwrap().elements.contains_key("detector"));
        config.init_logging();
    }
}
