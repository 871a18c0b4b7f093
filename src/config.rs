//! Lab configuration using figment.
//!
//! Configuration is loaded from:
//! 1. the TOML file given on the command line
//! 2. environment variables prefixed with `MICROLAB_`, `__` separating
//!    nesting levels (`MICROLAB_TASKS__WORKERS=8`)
//!
//! # Example
//!
//! ```toml
//! [lab]
//! name = "bench"
//!
//! [control]
//! controller = "ctrl"
//! target = 37.0
//!
//! [tasks]
//! database = "state/tasks.redb"
//!
//! [recipe]
//! dispenser = "pump"
//!
//! [[devices]]
//! id = "thermo"
//! type = "thermometer"
//! implementation = "simulated"
//! ```

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use microlab_control::ControlLoopConfig;
use microlab_core::DeviceType;
use microlab_hardware::config::loader::check;
use microlab_hardware::HardwareConfig;
use microlab_tasks::{RecipeRoles, TaskConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::path::Path;
use tracing::{debug, info};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "MICROLAB_";

fn default_name() -> String {
    "microlab".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[lab]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct LabSection {
    /// Name shown in logs.
    #[serde(default = "default_name")]
    #[validate(min_length = 1)]
    pub name: String,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    #[validate(enumerate = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: String,
}

impl Default for LabSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Validate)]
pub struct LabConfig {
    #[serde(default)]
    #[validate]
    pub lab: LabSection,

    /// Temperature control loop; absent means no loop runs.
    #[serde(default)]
    #[validate]
    pub control: Option<ControlLoopConfig>,

    #[serde(default)]
    #[validate]
    pub tasks: TaskConfig,

    /// Devices recipe base tasks run on.
    #[serde(default)]
    #[validate]
    pub recipe: RecipeRoles,

    /// `[[gpio]]` and `[[devices]]`.
    #[serde(flatten)]
    #[validate]
    pub hardware: HardwareConfig,
}

impl LabConfig {
    /// Load `path` with environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        debug!("Loading lab config from: {}", path.display());
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config = Self::from_figment(figment)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        info!(
            lab = %config.lab.name,
            devices = config.hardware.devices.len(),
            "Loaded lab config"
        );
        Ok(config)
    }

    /// Parse and validate a TOML string without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    /// Extract from any figment, then validate.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.check()?;
        Ok(config)
    }

    /// Field rules, hardware cross-entry rules, then section references.
    pub fn check(&self) -> Result<()> {
        if let Err(errors) = self.validate() {
            bail!("Schema validation failed:\n{}", errors);
        }
        check(&self.hardware)?;

        if let Some(control) = &self.control {
            match self.hardware.device(&control.controller) {
                None => bail!(
                    "[control] controller '{}' is not a configured device",
                    control.controller
                ),
                Some(device) if device.device_type != DeviceType::TemperatureController => bail!(
                    "[control] controller '{}' is a {}, not a temperatureController",
                    control.controller,
                    device.device_type
                ),
                Some(_) => {}
            }
            if let Some(target) = control.target {
                if !target.is_finite() {
                    bail!("[control] target must be a finite temperature");
                }
            }
        }
        Ok(())
    }

    /// JSON schema of the whole file.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(LabConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENCH: &str = r#"
        [lab]
        name = "bench"

        [control]
        controller = "ctrl"
        target = 37.0

        [tasks]
        workers = 2

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
    "#;

    #[test]
    fn sections_and_defaults() {
        let config = LabConfig::from_toml_str(BENCH).unwrap();
        assert_eq!(config.lab.name, "bench");
        assert_eq!(config.lab.log_level, "info");
        assert_eq!(config.control.as_ref().unwrap().target, Some(37.0));
        assert_eq!(config.control.as_ref().unwrap().period_ms, 1000);
        assert_eq!(config.tasks.workers, 2);
        assert_eq!(config.tasks.max_retries, 3);
        assert_eq!(config.recipe, RecipeRoles::default());
        assert_eq!(config.hardware.devices.len(), 2);
    }

    #[test]
    fn empty_file_is_valid() {
        let config = LabConfig::from_toml_str("").unwrap();
        assert!(config.control.is_none());
        assert!(config.hardware.devices.is_empty());
    }

    #[test]
    fn control_must_name_a_controller() {
        let config = BENCH.replace("controller = \"ctrl\"", "controller = \"thermo\"");
        let err = LabConfig::from_toml_str(&config).unwrap_err();
        assert!(err.to_string().contains("not a temperatureController"), "{err}");

        let config = BENCH.replace("controller = \"ctrl\"", "controller = \"ghost\"");
        let err = LabConfig::from_toml_str(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn hardware_rules_still_apply() {
        let config = format!(
            "{}\n[[devices]]\nid = \"thermo\"\ntype = \"stirrer\"\nimplementation = \"simulated\"\n",
            BENCH
        );
        assert!(LabConfig::from_toml_str(&config).is_err());
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("microlab.toml", BENCH)?;
            jail.set_env("MICROLAB_TASKS__WORKERS", "6");
            jail.set_env("MICROLAB_CONTROL__TARGET", "30.5");

            let config = LabConfig::load(Path::new("microlab.toml"))
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.tasks.workers, 6);
            assert_eq!(config.control.unwrap().target, Some(30.5));
            Ok(())
        });
    }

    #[test]
    fn schema_names_every_section() {
        let schema = LabConfig::json_schema().unwrap();
        for section in ["lab", "control", "tasks", "recipe", "devices", "gpio"] {
            assert!(schema.contains(&format!("\"{}\"", section)), "{section}");
        }
    }
}
