//! Bring-up of complete configurations through the device registry.

use microlab_core::capabilities::ActuatorState;
use microlab_core::driver::Capability;
use microlab_core::LabError;
use microlab_hardware::{DeviceRegistry, DriverCatalog, HardwareConfig};

fn parse(toml: &str) -> HardwareConfig {
    toml::from_str(toml).unwrap()
}

async fn bring_up(toml: &str) -> Result<DeviceRegistry, LabError> {
    DeviceRegistry::bring_up(&parse(toml), &DriverCatalog::with_builtin_drivers()).await
}

const SIMULATED_LAB: &str = r#"
[[devices]]
id = "ctrl"
type = "temperatureController"
implementation = "simulated"
dependencies = ["thermo"]
[devices.parameters]
thermometer = "thermo"

[[devices]]
id = "thermo"
type = "thermometer"
implementation = "simulated"
[devices.parameters]
initial_temperature = 30.0

[[devices]]
id = "pump"
type = "reagentDispenser"
implementation = "simulated"
[devices.parameters]
time_scale = 0.0

[[devices]]
id = "stirrer"
type = "stirrer"
implementation = "simulated"
"#;

#[tokio::test]
async fn simulated_lab_comes_up_dependencies_first() {
    let registry = bring_up(SIMULATED_LAB).await.unwrap();

    assert_eq!(registry.len(), 4);
    assert_eq!(registry.init_order(), ["thermo", "ctrl", "pump", "stirrer"]);
    assert_eq!(
        registry.devices_with_capability(Capability::Thermometer),
        vec!["thermo".to_string()]
    );

    let info = registry.device_info("ctrl").unwrap();
    assert_eq!(info.implementation, "simulated");
    assert_eq!(info.dependencies, vec!["thermo".to_string()]);
    assert_eq!(info.capabilities, vec![Capability::TemperatureController]);

    let ctrl = registry.temperature_controller("ctrl").unwrap();
    assert_eq!(ctrl.thermometer_id(), "thermo");
    let thermo = registry.require_thermometer(ctrl.thermometer_id()).unwrap();
    let reading = thermo.read_temperature().await.unwrap();
    assert!((reading - 30.0).abs() < 0.5);

    ctrl.apply(ActuatorState::Heating).await.unwrap();
    assert_eq!(ctrl.state(), ActuatorState::Heating);
}

#[tokio::test]
async fn typed_lookup_distinguishes_missing_from_wrong_type() {
    let registry = bring_up(SIMULATED_LAB).await.unwrap();

    assert!(matches!(
        registry.require_stirrer("thermo"),
        Err(LabError::CapabilityMismatch { .. })
    ));
    assert!(matches!(
        registry.require_stirrer("nope"),
        Err(LabError::UnknownDevice(_))
    ));
    assert!(registry.reagent_dispenser("stirrer").is_none());
}

#[tokio::test]
async fn cycle_is_a_configuration_error() {
    let err = bring_up(
        r#"
        [[devices]]
        id = "a"
        type = "stirrer"
        implementation = "simulated"
        dependencies = ["b"]

        [[devices]]
        id = "b"
        type = "stirrer"
        implementation = "simulated"
        dependencies = ["a"]
        "#,
    )
    .await
    .err()
    .unwrap();

    let message = err.to_string();
    assert!(matches!(err, LabError::Configuration(_)));
    assert!(message.contains("cycle"), "{message}");
    assert!(message.contains('a') && message.contains('b'));
}

#[tokio::test]
async fn unknown_dependency_names_both_ids() {
    let err = bring_up(
        r#"
        [[devices]]
        id = "ctrl"
        type = "stirrer"
        implementation = "simulated"
        dependencies = ["ghost"]
        "#,
    )
    .await
    .err()
    .unwrap();
    let message = err.to_string();
    assert!(message.contains("ctrl") && message.contains("ghost"), "{message}");
}

#[tokio::test]
async fn unknown_implementation_is_rejected() {
    let err = bring_up(
        r#"
        [[devices]]
        id = "thermo"
        type = "thermometer"
        implementation = "max31865"
        "#,
    )
    .await
    .err()
    .unwrap();
    let message = err.to_string();
    assert!(message.contains("max31865"), "{message}");
    assert!(message.contains("ds18b20, simulated"), "{message}");
}

#[tokio::test]
async fn controller_must_declare_its_thermometer() {
    let err = bring_up(
        r#"
        [[devices]]
        id = "thermo"
        type = "thermometer"
        implementation = "simulated"

        [[devices]]
        id = "ctrl"
        type = "temperatureController"
        implementation = "simulated"
        [devices.parameters]
        thermometer = "thermo"
        "#,
    )
    .await
    .err()
    .unwrap();
    assert!(err.to_string().contains("not a declared dependency"), "{err}");
}

const GPIO_LAB: &str = r#"
[[gpio]]
id = "gpio0"
implementation = "simulated"

[[devices]]
id = "thermo"
type = "thermometer"
implementation = "simulated"

[[devices]]
id = "ctrl"
type = "temperatureController"
implementation = "gpio"
dependencies = ["thermo"]
[devices.parameters]
thermometer = "thermo"
heater = { gpio_id = "gpio0", pin = 17 }
heater_pump = { gpio_id = "gpio0", pin = 27 }
cooler = { gpio_id = "gpio0", pin = 22 }

[[devices]]
id = "stirrer"
type = "stirrer"
implementation = "gpio"
[devices.parameters]
pin = { gpioID = "gpio0", pin = 23 }
"#;

#[tokio::test]
async fn gpio_devices_share_one_controller() {
    let registry = bring_up(GPIO_LAB).await.unwrap();
    assert!(registry.gpio_controllers().contains_key("gpio0"));

    let stirrer = registry.require_stirrer("stirrer").unwrap();
    stirrer.set_running(true).await.unwrap();
    assert!(stirrer.is_running());
}

#[tokio::test]
async fn same_pin_in_board_numbering_conflicts() {
    // board pin 16 is BCM 23, already used by the controller's cooler
    let config = GPIO_LAB
        .replace("cooler = { gpio_id = \"gpio0\", pin = 22 }", "cooler = { gpio_id = \"gpio0\", pin = 23 }")
        .replace("pin = { gpioID = \"gpio0\", pin = 23 }", "pin = { gpioID = \"gpio0\", numbering = \"board\", pin = 16 }");
    let err = bring_up(&config).await.err().unwrap();
    let message = err.to_string();
    assert!(message.contains("claimed by both"), "{message}");
    assert!(message.contains("ctrl") && message.contains("stirrer"), "{message}");
}

#[tokio::test]
async fn pin_on_undeclared_controller_is_rejected() {
    let config = GPIO_LAB.replace("gpioID = \"gpio0\"", "gpioID = \"gpio9\"");
    let err = bring_up(&config).await.err().unwrap();
    assert!(err.to_string().contains("gpio9"), "{err}");
}

#[tokio::test]
async fn build_failure_aborts_bring_up() {
    let tmp = tempfile::tempdir().unwrap();
    let config = format!(
        r#"
        [[devices]]
        id = "stirrer"
        type = "stirrer"
        implementation = "simulated"

        [[devices]]
        id = "thermo"
        type = "thermometer"
        implementation = "ds18b20"
        [devices.parameters]
        sensor_id = "28-0000deadbeef"
        base_path = "{}"
        "#,
        tmp.path().display()
    );
    let err = bring_up(&config).await.err().unwrap();
    let message = err.to_string();
    assert!(message.contains("failed to initialize device 'thermo'"), "{message}");
}

#[tokio::test]
async fn invalid_parameters_fail_before_any_build() {
    let err = bring_up(
        r#"
        [[devices]]
        id = "pump"
        type = "reagentDispenser"
        implementation = "simulated"
        [devices.parameters.axes.A]
        mm_per_rev = -1.0
        steps_per_rev = 200
        mm_per_ml = 3.5
        max_mm_per_min = 240.0
        "#,
    )
    .await
    .err()
    .unwrap();
    assert!(err.to_string().contains("pump"), "{err}");
}
