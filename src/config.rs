//! Runtime knobs for the residency controller.

use crate::error::ResidencyResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration shared by every engine context of a [`crate::Context`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Register each controller with the OS trim notification table.
    pub register_trim_callback: bool,

    /// Allow the make-resident retry ladder to ask the kernel driver to drop
    /// its temporary resource cache before the last-resort call.
    pub evict_temporary_resources: bool,

    /// Emit one trace event per handle made resident or evicted.
    pub residency_logging: bool,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            register_trim_callback: true,
            evict_temporary_resources: true,
            residency_logging: false,
        }
    }
}

impl ResidencyConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> ResidencyResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a configuration file.
    pub fn from_path(path: &Path) -> ResidencyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResidencyError;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ResidencyConfig::from_toml_str("").unwrap();
        assert_eq!(config, ResidencyConfig::default());
        assert!(config.register_trim_callback);
        assert!(config.evict_temporary_resources);
        assert!(!config.residency_logging);
    }

    #[test]
    fn partial_document_overrides_only_named_keys() {
        let config = ResidencyConfig::from_toml_str(
            "register_trim_callback = false\nresidency_logging = true\n",
        )
        .unwrap();
        assert!(!config.register_trim_callback);
        assert!(config.evict_temporary_resources);
        assert!(config.residency_logging);
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        let err = ResidencyConfig::from_toml_str("register_trim_callback = 3").unwrap_err();
        assert!(matches!(err, ResidencyError::Config(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ResidencyConfig::from_path(Path::new("/nonexistent/residency.toml")).unwrap_err();
        assert!(matches!(err, ResidencyError::Io(_)));
    }
}
