//! Cross-entry validation for hardware configuration.
//!
//! `serde_valid` checks individual fields; the rules here need the whole
//! configuration: unique ids, dependency references, GPIO implementations.

use super::schema::HardwareConfig;
use crate::gpio::GPIO_IMPLEMENTATIONS;
use std::collections::HashSet;

/// Validate a device or controller identifier.
///
/// Used by `serde_valid` on fields marked
/// `#[validate(custom(validate_identifier))]`. Identifiers are non-empty and
/// limited to ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_identifier(id: &String) -> Result<(), serde_valid::validation::Error> {
    if id.is_empty() {
        return Err(serde_valid::validation::Error::Custom(
            "identifier must not be empty".to_string(),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(serde_valid::validation::Error::Custom(format!(
            "identifier '{}' contains invalid character '{}'",
            id, c
        )));
    }
    Ok(())
}

/// A cross-entry configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("duplicate device id '{0}'")]
    DuplicateDeviceId(String),

    #[error("duplicate GPIO controller id '{0}'")]
    DuplicateGpioId(String),

    #[error("unknown GPIO implementation '{implementation}' for controller '{gpio_id}' (known: {known})")]
    UnknownGpioImplementation {
        gpio_id: String,
        implementation: String,
        known: String,
    },

    #[error("device '{0}' depends on itself")]
    SelfDependency(String),

    #[error("device '{device}' depends on unknown device '{dependency}'")]
    UnknownDependency { device: String, dependency: String },

    #[error("device '{device}' lists dependency '{dependency}' more than once")]
    RepeatedDependency { device: String, dependency: String },
}

/// Run every cross-entry check and collect all failures.
pub fn validate_hardware_config(config: &HardwareConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut gpio_ids = HashSet::new();
    for gpio in &config.gpio {
        if !gpio_ids.insert(gpio.id.as_str()) {
            errors.push(ValidationError::DuplicateGpioId(gpio.id.clone()));
        }
        if !GPIO_IMPLEMENTATIONS.contains(&gpio.implementation.as_str()) {
            errors.push(ValidationError::UnknownGpioImplementation {
                gpio_id: gpio.id.clone(),
                implementation: gpio.implementation.clone(),
                known: GPIO_IMPLEMENTATIONS.join(", "),
            });
        }
    }

    let mut device_ids = HashSet::new();
    for device in &config.devices {
        if !device_ids.insert(device.id.as_str()) {
            errors.push(ValidationError::DuplicateDeviceId(device.id.clone()));
        }
    }

    for device in &config.devices {
        let mut seen = HashSet::new();
        for dependency in &device.dependencies {
            if dependency == &device.id {
                errors.push(ValidationError::SelfDependency(device.id.clone()));
            } else if !device_ids.contains(dependency.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    device: device.id.clone(),
                    dependency: dependency.clone(),
                });
            }
            if !seen.insert(dependency.as_str()) {
                errors.push(ValidationError::RepeatedDependency {
                    device: device.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DeviceConfig;
    use microlab_core::DeviceType;

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig::new(id, DeviceType::Thermometer, "simulated")
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier(&"thermo-1".to_string()).is_ok());
        assert!(validate_identifier(&"".to_string()).is_err());
        assert!(validate_identifier(&"a b".to_string()).is_err());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let config = HardwareConfig {
            gpio: vec![],
            devices: vec![device("thermo"), device("thermo")],
        };
        let errors = validate_hardware_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateDeviceId("thermo".into())]
        );
    }

    #[test]
    fn unresolved_and_self_dependencies_are_reported() {
        let config = HardwareConfig {
            gpio: vec![],
            devices: vec![
                device("a").depends_on("missing"),
                device("b").depends_on("b"),
            ],
        };
        let errors = validate_hardware_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::UnknownDependency {
            device: "a".into(),
            dependency: "missing".into(),
        }));
        assert!(errors.contains(&ValidationError::SelfDependency("b".into())));
    }

    #[test]
    fn valid_config_passes() {
        let config = HardwareConfig {
            gpio: vec![],
            devices: vec![device("thermo"), device("probe").depends_on("thermo")],
        };
        assert!(validate_hardware_config(&config).is_ok());
    }
}
