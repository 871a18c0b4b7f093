//! Configuration schema types.

use super::validation::validate_identifier;
use microlab_core::DeviceType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// The `[[gpio]]` and `[[devices]]` sections of a microlab configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Validate)]
pub struct HardwareConfig {
    /// GPIO controllers devices may reference by id.
    #[serde(default)]
    #[validate]
    pub gpio: Vec<GpioControllerConfig>,

    /// Configured devices, in declaration order.
    #[serde(default)]
    #[validate]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// A GPIO controller declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct GpioControllerConfig {
    #[validate(custom(validate_identifier))]
    pub id: String,

    /// `sysfs` or `simulated`.
    #[validate(min_length = 1)]
    pub implementation: String,

    #[serde(default = "empty_table")]
    #[schemars(with = "serde_json::Value")]
    pub parameters: toml::Value,
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct DeviceConfig {
    /// Unique identifier (e.g. "thermo", "ctrl").
    #[validate(custom(validate_identifier))]
    pub id: String,

    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub device_type: DeviceType,

    /// Variant registered for this type (e.g. "simulated", "gpio").
    #[validate(min_length = 1)]
    pub implementation: String,

    /// Devices that must be live before this one is built.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Type- and implementation-specific parameters.
    #[serde(default = "empty_table")]
    #[schemars(with = "serde_json::Value")]
    pub parameters: toml::Value,
}

impl DeviceConfig {
    pub fn new(
        id: impl Into<String>,
        device_type: DeviceType,
        implementation: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_type,
            implementation: implementation.into(),
            dependencies: Vec::new(),
            parameters: empty_table(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_parameters(mut self, parameters: toml::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// JSON schema of the hardware configuration.
pub fn generate_json_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(HardwareConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_default_to_empty_table() {
        let config: HardwareConfig = toml::from_str(
            r#"
            [[devices]]
            id = "stirrer"
            type = "stirrer"
            implementation = "simulated"
            "#,
        )
        .unwrap();
        let device = &config.devices[0];
        assert!(device.parameters.as_table().unwrap().is_empty());
        assert!(device.dependencies.is_empty());
        assert_eq!(device.device_type, DeviceType::Stirrer);
    }

    #[test]
    fn schema_mentions_devices() {
        let schema = serde_json::to_string(&generate_json_schema()).unwrap();
        assert!(schema.contains("devices"));
        assert!(schema.contains("implementation"));
    }
}
