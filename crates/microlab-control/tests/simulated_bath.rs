//! The loop holding a simulated bath at its target.

use microlab_control::{ControlLoop, ControlLoopConfig};
use microlab_core::capabilities::ActuatorState;
use microlab_hardware::{DeviceRegistry, DriverCatalog, HardwareConfig};
use std::time::Duration;
use tokio::sync::broadcast;

const BATH: &str = r#"
[[devices]]
id = "thermo"
type = "thermometer"
implementation = "simulated"
[devices.parameters]
initial_temperature = 30.0
ambient_temperature = 22.0

[[devices]]
id = "ctrl"
type = "temperatureController"
implementation = "simulated"
dependencies = ["thermo"]
[devices.parameters]
thermometer = "thermo"
deadband = 0.5
"#;

async fn registry() -> DeviceRegistry {
    let config: HardwareConfig = toml::from_str(BATH).unwrap();
    DeviceRegistry::bring_up(&config, &DriverCatalog::with_builtin_drivers())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn bath_settles_inside_the_band() {
    let registry = registry().await;
    let config = ControlLoopConfig {
        target: Some(37.0),
        ..ControlLoopConfig::new("ctrl")
    };
    let (control, handle) = ControlLoop::new(&registry, &config).unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(control.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(900)).await;
    let status = handle.status();
    let temperature = status.current.unwrap().temperature;
    assert!((temperature - 37.0).abs() < 1.0, "temperature {temperature}");
    assert!(!status.faulted);

    // a new target moves the bath down
    handle.set_target(33.0).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(handle.status().state, ActuatorState::Cooling);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
    let ctrl = registry.temperature_controller("ctrl").unwrap();
    assert_eq!(ctrl.state(), ActuatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn without_target_the_loop_only_monitors() {
    let registry = registry().await;
    let (control, handle) = ControlLoop::new(&registry, &ControlLoopConfig::new("ctrl")).unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(control.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = handle.status();
    assert_eq!(status.state, ActuatorState::Idle);
    assert!(status.current.is_some());
    assert!(status.previous.is_some());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}
