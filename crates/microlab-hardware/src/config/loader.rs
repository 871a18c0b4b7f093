//! Configuration loading utilities.
//!
//! ```rust,ignore
//! use microlab_hardware::config::load_hardware_config;
//! use std::path::Path;
//!
//! let config = load_hardware_config(Path::new("config/microlab.toml"))?;
//! ```

use super::schema::HardwareConfig;
use super::validation::validate_hardware_config;
use anyhow::{Context, Result};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde_valid::Validate;
use std::path::Path;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong types)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Cross-entry validation error
    #[error("Config validation failed:\n{0}")]
    ValidationError(String),

    /// Per-field schema validation error
    #[error("Schema validation failed:\n{0}")]
    SchemaValidationError(String),
}

/// Load hardware configuration from a TOML file.
///
/// 1. Reads the file through figment
/// 2. Deserializes `[[gpio]]` and `[[devices]]`
/// 3. Runs field validation, then cross-entry validation
pub fn load_hardware_config(path: &Path) -> Result<HardwareConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("Loading hardware config from: {}", path.display());

    let config: HardwareConfig = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    check(&config)?;

    info!(
        "Loaded hardware config: {} device(s), {} GPIO controller(s)",
        config.devices.len(),
        config.gpio.len()
    );

    Ok(config)
}

/// Load hardware configuration from a TOML string.
///
/// Useful for tests and embedded configurations.
pub fn load_hardware_config_from_str(toml_content: &str) -> Result<HardwareConfig> {
    let config: HardwareConfig = Figment::new()
        .merge(Toml::string(toml_content))
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;

    check(&config)?;
    Ok(config)
}

/// Field validation followed by cross-entry validation.
pub fn check(config: &HardwareConfig) -> Result<(), ConfigLoadError> {
    if let Err(errors) = config.validate() {
        return Err(ConfigLoadError::SchemaValidationError(errors.to_string()));
    }

    if let Err(errors) = validate_hardware_config(config) {
        let messages: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        return Err(ConfigLoadError::ValidationError(messages.join("\n")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SIMULATED: &str = r#"
        [[devices]]
        id = "thermo"
        type = "thermometer"
        implementation = "simulated"

        [[devices]]
        id = "ctrl"
        type = "temperatureController"
        implementation = "simulated"
        dependencies = ["thermo"]
        [devices.parameters]
        thermometer = "thermo"
        deadband = 0.5
    "#;

    #[test]
    fn loads_from_string() {
        let config = load_hardware_config_from_str(SIMULATED).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].dependencies, vec!["thermo".to_string()]);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SIMULATED.as_bytes()).unwrap();
        let config = load_hardware_config(file.path()).unwrap();
        assert!(config.device("ctrl").is_some());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_hardware_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let err = load_hardware_config_from_str(
            r#"
            [[devices]]
            id = "x"
            type = "centrifuge"
            implementation = "simulated"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn invalid_identifier_fails_schema_validation() {
        let err = load_hardware_config_from_str(
            r#"
            [[devices]]
            id = "bad id"
            type = "stirrer"
            implementation = "simulated"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Schema validation failed"));
    }
}
