//! Syringe pump dispenser driven by a G-code motion controller over serial.
//!
//! Every dispense is sent as:
//!
//! ```text
//! G91                      relative positioning
//! G1 <axis><mm> F<mm/min>  move, quantised to whole steps
//! M400                     wait for motion to finish
//! ```
//!
//! Each line is acknowledged with `ok`. `error...` and `ALARM...` replies are
//! permanent faults. No acknowledgement within the timeout is transient while
//! nothing has moved; once the `G1` line is on the wire any failure is
//! permanent, since repeating a relative move dispenses the volume again.
//! Input left over from an earlier exchange is discarded before each line.
//!
//! # Configuration
//!
//! ```toml
//! [[devices]]
//! id = "pump"
//! type = "reagentDispenser"
//! implementation = "gcode"
//! [devices.parameters]
//! port = "/dev/ttyACM0"
//! baud = 115200
//! timeout_ms = 5000
//! [devices.parameters.axes.A]
//! gcode_axis = "X"
//! mm_per_rev = 0.8
//! steps_per_rev = 200
//! mm_per_ml = 3.5
//! max_mm_per_min = 240.0
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::{DispenseRequest, ReagentDispenser};
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
    ResourceClaim,
};
use microlab_core::motion::{MotionPlan, SyringePumpAxisConfig};
use microlab_core::serial::{discard_pending, write_line, DynSerial, SerialSettings, SharedPort};
use microlab_core::{DeviceResult, DriverError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use serde_valid::Validate;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const DRIVER: &str = "gcode";

/// Calibration of one axis plus how it maps onto the motion controller.
#[derive(Debug, Clone, Deserialize)]
pub struct GcodeAxisConfig {
    #[serde(flatten)]
    pub calibration: SyringePumpAxisConfig,
    /// Controller axis letter; defaults to the axis label.
    #[serde(default)]
    pub gcode_axis: Option<String>,
    /// Dispense by moving in the negative direction.
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct GcodeParams {
    #[serde(flatten)]
    link: SerialSettings,
    axes: BTreeMap<String, GcodeAxisConfig>,
}

impl GcodeParams {
    fn validate(&self) -> Result<()> {
        if let Err(errors) = self.link.validate() {
            bail!("serial link: {}", errors);
        }
        if self.axes.is_empty() {
            bail!("at least one axis must be configured");
        }
        for (label, axis) in &self.axes {
            axis.calibration
                .check()
                .map_err(|e| anyhow::anyhow!("axis '{}': {}", label, e))?;
            let letter = axis.gcode_axis.as_deref().unwrap_or(label);
            if letter.len() != 1 || !letter.chars().all(|c| c.is_ascii_alphabetic()) {
                bail!(
                    "axis '{}': G-code axis must be a single letter (got '{}')",
                    label,
                    letter
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Line protocol
// =============================================================================

/// Send one line and wait for its `ok`.
async fn send_command(
    port: &mut BufReader<DynSerial>,
    line: &str,
    timeout: Duration,
) -> DeviceResult<()> {
    let stale = discard_pending(port);
    if stale > 0 {
        debug!(bytes = stale, "discarded stale G-code input");
    }
    debug!(command = line, "G-code >");
    let io_err = |e: std::io::Error| DriverError::from_io(DRIVER, line, &e);
    write_line(port, line).await.map_err(io_err)?;

    let acknowledged = async {
        loop {
            let mut reply = String::new();
            let n = port.read_line(&mut reply).await.map_err(io_err)?;
            if n == 0 {
                return Err(DriverError::communication(
                    DRIVER,
                    format!("link closed while waiting for '{}'", line),
                ));
            }
            let reply = reply.trim();
            debug!(reply, "G-code <");
            if reply.starts_with("ok") {
                return Ok(());
            }
            if reply.starts_with("error") || reply.starts_with("ALARM") || reply.starts_with("!!") {
                return Err(DriverError::hardware(
                    DRIVER,
                    format!("'{}' rejected: {}", line, reply),
                ));
            }
            // Status chatter such as "echo:busy: processing" is ignored.
        }
    };

    tokio::time::timeout(timeout, acknowledged)
        .await
        .map_err(|_| {
            DriverError::timeout(
                DRIVER,
                format!("no acknowledgement for '{}' within {:?}", line, timeout),
            )
        })?
}

/// Format the relative move for a plan.
pub fn move_command(axis_letter: &str, travel_mm: f64, feed_mm_per_min: f64) -> String {
    format!("G1 {}{:.4} F{:.3}", axis_letter, travel_mm, feed_mm_per_min)
}

// =============================================================================
// Dispenser
// =============================================================================

pub struct GcodeDispenser {
    port: SharedPort,
    axes: BTreeMap<String, GcodeAxisConfig>,
    timeout: Duration,
}

impl GcodeDispenser {
    pub fn new(port: SharedPort, axes: BTreeMap<String, GcodeAxisConfig>, timeout: Duration) -> Self {
        Self {
            port,
            axes,
            timeout,
        }
    }
}

#[async_trait]
impl ReagentDispenser for GcodeDispenser {
    fn axes(&self) -> Vec<String> {
        self.axes.keys().cloned().collect()
    }

    fn axis_config(&self, axis: &str) -> Option<SyringePumpAxisConfig> {
        self.axes.get(axis).map(|a| a.calibration)
    }

    fn driver_name(&self) -> &'static str {
        DRIVER
    }

    async fn dispense(&self, request: DispenseRequest) -> DeviceResult<MotionPlan> {
        let plan = self.plan(&request)?;
        if plan.steps == 0 {
            return Ok(plan);
        }
        let axis = self.axes.get(&request.axis).ok_or_else(|| {
            DriverError::invalid_parameter(DRIVER, format!("unknown axis '{}'", request.axis))
        })?;

        let letter = axis.gcode_axis.as_deref().unwrap_or(&request.axis);
        let direction = if axis.invert { -1.0 } else { 1.0 };
        let travel = plan.travel_mm(&axis.calibration) * direction;
        let feed = plan.feed_mm_per_min(&axis.calibration);

        let mut port = self.port.lock().await;
        send_command(&mut port, "G91", self.timeout).await?;

        let command = move_command(letter, travel, feed);
        let moved = async {
            send_command(&mut port, &command, self.timeout).await?;
            // M400 returns only after the move, so allow for its duration.
            send_command(&mut port, "M400", self.timeout + plan.duration()).await
        };
        moved.await.map_err(|e| move_unconfirmed(&command, e))?;

        Ok(plan)
    }
}

/// A failure after the move was sent must not be retried.
fn move_unconfirmed(command: &str, err: DriverError) -> DriverError {
    if !err.is_transient() {
        return err;
    }
    warn!(command, error = %err, "G-code move issued, completion unconfirmed");
    DriverError::hardware(
        DRIVER,
        format!("move issued, completion unconfirmed ('{}'): {}", command, err.message),
    )
}

pub struct GcodeDispenserFactory;

impl DriverFactory for GcodeDispenserFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::ReagentDispenser
    }

    fn implementation(&self) -> &'static str {
        "gcode"
    }

    fn name(&self) -> &'static str {
        "G-code Syringe Pump"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: GcodeParams = parse_params(DRIVER, params)?;
        params.validate()
    }

    fn resource_claims(&self, params: &toml::Value) -> Result<Vec<ResourceClaim>> {
        let params: GcodeParams = parse_params(DRIVER, params)?;
        Ok(vec![ResourceClaim::SerialPort(params.link.port)])
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: GcodeParams = parse_params(DRIVER, &ctx.params)?;
            params.validate()?;
            let port = open_port(&params.link).await?;
            info!(device_id = %ctx.device_id, port = %params.link.port, baud = params.link.baud, "G-code dispenser connected");

            let axes: Vec<String> = params.axes.keys().cloned().collect();
            let dispenser = Arc::new(GcodeDispenser::new(
                port,
                params.axes,
                params.link.timeout(),
            ));
            Ok(DeviceComponents::new()
                .with_reagent_dispenser(dispenser)
                .with_metadata(DeviceMetadata {
                    axes,
                    ..Default::default()
                }))
        })
    }
}

#[cfg(feature = "serial")]
async fn open_port(link: &SerialSettings) -> Result<SharedPort> {
    microlab_core::serial::open(link).await
}

#[cfg(not(feature = "serial"))]
async fn open_port(link: &SerialSettings) -> Result<SharedPort> {
    bail!(
        "cannot open {}: microlab-hardware was built without the 'serial' feature",
        link.port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use microlab_core::serial::shared;
    use microlab_core::DriverErrorKind;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;

    fn axes(gcode_axis: Option<&str>, invert: bool) -> BTreeMap<String, GcodeAxisConfig> {
        BTreeMap::from([(
            "A".to_string(),
            GcodeAxisConfig {
                calibration: SyringePumpAxisConfig::new(0.8, 200, 3.5, 240.0),
                gcode_axis: gcode_axis.map(str::to_string),
                invert,
            },
        )])
    }

    /// Fake controller: records received lines, answers with `reply(line)`.
    fn fake_controller(
        reply: fn(&str) -> Option<&'static str>,
    ) -> (SharedPort, mpsc::UnboundedReceiver<String>) {
        let (host, device) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(device);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let answer = reply(&line);
                let _ = tx.send(line);
                if let Some(answer) = answer {
                    if write.write_all(answer.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        (shared(Box::new(host)), rx)
    }

    #[test]
    fn move_command_format() {
        assert_eq!(move_command("X", 3.5, 240.0), "G1 X3.5000 F240.000");
        assert_eq!(move_command("A", -0.004, 12.5), "G1 A-0.0040 F12.500");
    }

    #[tokio::test]
    async fn dispense_sends_relative_move_and_waits() {
        let (port, mut rx) = fake_controller(|_| Some("ok\n"));
        let pump = GcodeDispenser::new(port, axes(Some("X"), false), Duration::from_secs(1));

        let plan = pump.dispense(DispenseRequest::new("A", 1.0)).await.unwrap();
        assert_eq!(plan.steps, 875);

        assert_eq!(rx.recv().await.unwrap(), "G91");
        assert_eq!(rx.recv().await.unwrap(), "G1 X3.5000 F240.000");
        assert_eq!(rx.recv().await.unwrap(), "M400");
    }

    #[tokio::test]
    async fn inverted_axis_moves_negative_and_clamps_feed() {
        let (port, mut rx) = fake_controller(|_| Some("echo:busy\nok\n"));
        let pump = GcodeDispenser::new(port, axes(None, true), Duration::from_secs(1));

        let plan = pump
            .dispense(DispenseRequest::new("A", 1.0).with_rate(500.0))
            .await
            .unwrap();
        assert!(plan.clamped);

        rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "G1 A-3.5000 F240.000");
    }

    #[tokio::test]
    async fn error_reply_is_permanent() {
        let (port, _rx) = fake_controller(|line| {
            if line.starts_with("G1") {
                Some("error:22\n")
            } else {
                Some("ok\n")
            }
        });
        let pump = GcodeDispenser::new(port, axes(None, false), Duration::from_secs(1));
        let err = pump.dispense(DispenseRequest::new("A", 1.0)).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(!err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_a_transient_timeout() {
        let (port, _rx) = fake_controller(|_| None);
        let pump = GcodeDispenser::new(port, axes(None, false), Duration::from_millis(200));
        let err = pump.dispense(DispenseRequest::new("A", 1.0)).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_move_is_not_retryable() {
        let (port, mut rx) = fake_controller(|line| if line == "M400" { None } else { Some("ok\n") });
        let pump = GcodeDispenser::new(port, axes(Some("X"), false), Duration::from_millis(50));
        let err = pump.dispense(DispenseRequest::new("A", 1.0)).await.unwrap_err();

        assert_eq!(rx.recv().await.unwrap(), "G91");
        assert_eq!(rx.recv().await.unwrap(), "G1 X3.5000 F240.000");
        assert_eq!(rx.recv().await.unwrap(), "M400");
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(!err.is_transient());
        assert!(err.message.contains("completion unconfirmed"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_move_is_not_retryable() {
        let (port, _rx) = fake_controller(|line| if line.starts_with("G1") { None } else { Some("ok\n") });
        let pump = GcodeDispenser::new(port, axes(None, false), Duration::from_millis(50));
        let err = pump.dispense(DispenseRequest::new("A", 1.0)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn late_ack_is_not_taken_for_the_next_command() {
        let (host, device) = tokio::io::duplex(1024);
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(device);
            let mut lines = BufReader::new(read).lines();
            let mut waits = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "M400" {
                    waits += 1;
                    if waits == 1 {
                        // answered long after the host gave up
                        tokio::time::sleep(Duration::from_millis(400)).await;
                    } else {
                        gate.notified().await;
                    }
                }
                if write.write_all(b"ok\n").await.is_err() {
                    break;
                }
            }
        });
        let pump = Arc::new(GcodeDispenser::new(
            shared(Box::new(host)),
            axes(None, false),
            Duration::from_millis(50),
        ));

        // 0.1 ml waits at most 50 ms plus the 87.5 ms move
        let err = pump.dispense(DispenseRequest::new("A", 0.1)).await.unwrap_err();
        assert!(!err.is_transient());
        tokio::time::sleep(Duration::from_millis(600)).await;

        let second = tokio::spawn({
            let pump = pump.clone();
            async move { pump.dispense(DispenseRequest::new("A", 1.0)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished(), "M400 must still be waiting for its own ack");

        release.notify_one();
        let plan = second.await.unwrap().unwrap();
        assert_eq!(plan.steps, 875);
    }

    #[tokio::test]
    async fn zero_volume_sends_nothing() {
        let (port, mut rx) = fake_controller(|_| Some("ok\n"));
        let pump = GcodeDispenser::new(port, axes(None, false), Duration::from_secs(1));
        let plan = pump.dispense(DispenseRequest::new("A", 0.0)).await.unwrap();
        assert_eq!(plan.steps, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn params_validation() {
        let good: toml::Value = toml::from_str(
            r#"
            port = "/dev/ttyACM0"
            [axes.A]
            mm_per_rev = 0.8
            steps_per_rev = 200
            mm_per_ml = 3.5
            max_mm_per_min = 240.0
            "#,
        )
        .unwrap();
        GcodeDispenserFactory.validate(&good).unwrap();
        assert_eq!(
            GcodeDispenserFactory.resource_claims(&good).unwrap(),
            vec![ResourceClaim::SerialPort("/dev/ttyACM0".into())]
        );

        let bad: toml::Value = toml::from_str(
            r#"
            port = "/dev/ttyACM0"
            [axes.A]
            gcode_axis = "XY"
            mm_per_rev = 0.8
            steps_per_rev = 200
            mm_per_ml = 3.5
            max_mm_per_min = 240.0
            "#,
        )
        .unwrap();
        assert!(GcodeDispenserFactory.validate(&bad).is_err());
    }
}
