//! Motion and unit conversion for syringe pump axes.
//!
//! Pure functions, no I/O. The motion controller works in whole motor steps
//! and steps per minute; recipes work in milliliters and ml/min.
//!
//! ```text
//! steps/ml      = mm_per_ml * steps_per_rev / mm_per_rev
//! max steps/min = max_mm_per_min * steps_per_rev / mm_per_rev
//! ```
//!
//! With `mm_per_rev = 0.8`, `steps_per_rev = 200`, `mm_per_ml = 3.5` and
//! `max_mm_per_min = 240`, one milliliter is 875 steps and the axis tops out
//! at 60000 steps/min.

use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::time::Duration;
use thiserror::Error;

/// Calibration of one syringe pump axis. All values must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct SyringePumpAxisConfig {
    /// Lead screw travel per motor revolution (mm).
    #[validate(exclusive_minimum = 0.0)]
    pub mm_per_rev: f64,

    /// Motor steps per revolution, microstepping included.
    #[validate(minimum = 1)]
    pub steps_per_rev: u32,

    /// Plunger travel per milliliter dispensed (mm).
    #[validate(exclusive_minimum = 0.0)]
    pub mm_per_ml: f64,

    /// Maximum plunger speed (mm/min).
    #[validate(exclusive_minimum = 0.0)]
    pub max_mm_per_min: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("invalid axis calibration: {0}")]
    InvalidCalibration(String),

    #[error("volume must be a finite, non-negative number of milliliters (got {0})")]
    InvalidVolume(f64),

    #[error("rate must be a finite, positive number of ml/min (got {0})")]
    InvalidRate(f64),
}

impl SyringePumpAxisConfig {
    pub fn new(mm_per_rev: f64, steps_per_rev: u32, mm_per_ml: f64, max_mm_per_min: f64) -> Self {
        Self {
            mm_per_rev,
            steps_per_rev,
            mm_per_ml,
            max_mm_per_min,
        }
    }

    /// Validate the calibration: every value finite and greater than zero.
    pub fn check(&self) -> Result<(), MotionError> {
        if let Err(errors) = self.validate() {
            return Err(MotionError::InvalidCalibration(errors.to_string()));
        }
        for (name, value) in [
            ("mm_per_rev", self.mm_per_rev),
            ("mm_per_ml", self.mm_per_ml),
            ("max_mm_per_min", self.max_mm_per_min),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MotionError::InvalidCalibration(format!(
                    "{} must be > 0 (got {})",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Steps per millimeter of plunger travel.
    pub fn steps_per_mm(&self) -> f64 {
        f64::from(self.steps_per_rev) / self.mm_per_rev
    }

    /// Steps per milliliter dispensed.
    pub fn steps_per_ml(&self) -> f64 {
        self.mm_per_ml * self.steps_per_mm()
    }
}

/// Whole steps needed to dispense `volume_ml`, rounded to the nearest step.
///
/// Negative and non-finite volumes yield zero steps.
pub fn steps_for_volume(volume_ml: f64, cfg: &SyringePumpAxisConfig) -> u64 {
    let steps = (volume_ml * cfg.steps_per_ml()).round();
    if steps.is_finite() && steps > 0.0 {
        steps as u64
    } else {
        0
    }
}

/// Volume dispensed by `steps` motor steps.
pub fn ml_from_steps(steps: u64, cfg: &SyringePumpAxisConfig) -> f64 {
    steps as f64 / cfg.steps_per_ml()
}

/// Fastest step rate the axis supports (steps/min).
pub fn max_step_rate(cfg: &SyringePumpAxisConfig) -> f64 {
    cfg.max_mm_per_min * cfg.steps_per_mm()
}

/// Step rate (steps/min) for a fluid rate (ml/min).
pub fn step_rate_for(rate_ml_per_min: f64, cfg: &SyringePumpAxisConfig) -> f64 {
    rate_ml_per_min * cfg.steps_per_ml()
}

/// Clamp a requested step rate to the axis maximum.
///
/// Returns the effective rate and whether clamping happened.
pub fn clamp_step_rate(requested: f64, cfg: &SyringePumpAxisConfig) -> (f64, bool) {
    let max = max_step_rate(cfg);
    if requested > max {
        (max, true)
    } else {
        (requested, false)
    }
}

/// A fully resolved dispense move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionPlan {
    /// Volume requested (ml).
    pub volume_ml: f64,
    /// Whole steps to move.
    pub steps: u64,
    /// Rate the caller asked for (steps/min), if any.
    pub requested_step_rate: Option<f64>,
    /// Rate the move will run at (steps/min).
    pub step_rate: f64,
    /// The requested rate exceeded the axis maximum.
    pub clamped: bool,
    /// Expected duration of the move (seconds).
    pub duration_secs: f64,
}

impl MotionPlan {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    /// Plunger travel (mm) for the quantised step count.
    pub fn travel_mm(&self, cfg: &SyringePumpAxisConfig) -> f64 {
        self.steps as f64 / cfg.steps_per_mm()
    }

    /// Feed rate (mm/min) corresponding to the effective step rate.
    pub fn feed_mm_per_min(&self, cfg: &SyringePumpAxisConfig) -> f64 {
        self.step_rate / cfg.steps_per_mm()
    }
}

/// Plan a dispense of `volume_ml` at an optional rate.
///
/// Without a requested rate the move runs at the axis maximum. Rates above
/// the maximum are clamped, not rejected.
pub fn plan_dispense(
    volume_ml: f64,
    rate_ml_per_min: Option<f64>,
    cfg: &SyringePumpAxisConfig,
) -> Result<MotionPlan, MotionError> {
    cfg.check()?;
    if !volume_ml.is_finite() || volume_ml < 0.0 {
        return Err(MotionError::InvalidVolume(volume_ml));
    }

    let requested_step_rate = match rate_ml_per_min {
        Some(rate) if !rate.is_finite() || rate <= 0.0 => {
            return Err(MotionError::InvalidRate(rate));
        }
        Some(rate) => Some(step_rate_for(rate, cfg)),
        None => None,
    };

    let (step_rate, clamped) = match requested_step_rate {
        Some(requested) => clamp_step_rate(requested, cfg),
        None => (max_step_rate(cfg), false),
    };

    let steps = steps_for_volume(volume_ml, cfg);
    let duration_secs = steps as f64 / step_rate * 60.0;

    Ok(MotionPlan {
        volume_ml,
        steps,
        requested_step_rate,
        step_rate,
        clamped,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_axis() -> SyringePumpAxisConfig {
        SyringePumpAxisConfig::new(0.8, 200, 3.5, 240.0)
    }

    #[test]
    fn reference_axis_numbers() {
        let cfg = reference_axis();
        assert_eq!(steps_for_volume(1.0, &cfg), 875);
        assert!((max_step_rate(&cfg) - 60_000.0).abs() < 1e-9);
    }

    #[test]
    fn steps_round_to_nearest() {
        let cfg = reference_axis();
        // 0.0012 ml = 1.05 steps, 0.0018 ml = 1.575 steps
        assert_eq!(steps_for_volume(0.0012, &cfg), 1);
        assert_eq!(steps_for_volume(0.0018, &cfg), 2);
        assert_eq!(steps_for_volume(-1.0, &cfg), 0);
        assert_eq!(steps_for_volume(f64::NAN, &cfg), 0);
    }

    #[test]
    fn steps_are_monotonic_in_volume() {
        let cfg = reference_axis();
        let mut previous = 0;
        for i in 0..2000 {
            let steps = steps_for_volume(i as f64 * 0.0007, &cfg);
            assert!(steps >= previous);
            previous = steps;
        }
    }

    #[test]
    fn inverse_within_one_step() {
        let cfg = SyringePumpAxisConfig::new(1.25, 3200, 2.2, 180.0);
        for steps in [0u64, 1, 17, 875, 12_345, 1_000_000] {
            let back = steps_for_volume(ml_from_steps(steps, &cfg), &cfg);
            assert!(back.abs_diff(steps) <= 1, "{steps} -> {back}");
        }
    }

    #[test]
    fn rates_above_max_are_clamped_exactly() {
        let cfg = reference_axis();
        // 100 ml/min = 87500 steps/min, over the 60000 limit
        let plan = plan_dispense(2.0, Some(100.0), &cfg).unwrap();
        assert!(plan.clamped);
        assert_eq!(plan.step_rate, max_step_rate(&cfg));
        assert_eq!(plan.requested_step_rate, Some(87_500.0));

        let slow = plan_dispense(2.0, Some(10.0), &cfg).unwrap();
        assert!(!slow.clamped);
        assert!((slow.step_rate - 8_750.0).abs() < 1e-9);
    }

    #[test]
    fn plan_without_rate_runs_at_max() {
        let cfg = reference_axis();
        let plan = plan_dispense(1.0, None, &cfg).unwrap();
        assert_eq!(plan.steps, 875);
        assert!(!plan.clamped);
        assert!((plan.duration_secs - 0.875).abs() < 1e-9);
        assert!((plan.travel_mm(&cfg) - 3.5).abs() < 1e-9);
        assert!((plan.feed_mm_per_min(&cfg) - 240.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let cfg = reference_axis();
        assert!(matches!(
            plan_dispense(-0.5, None, &cfg),
            Err(MotionError::InvalidVolume(_))
        ));
        assert!(matches!(
            plan_dispense(1.0, Some(0.0), &cfg),
            Err(MotionError::InvalidRate(_))
        ));

        let bad = SyringePumpAxisConfig::new(0.0, 200, 3.5, 240.0);
        assert!(matches!(
            bad.check(),
            Err(MotionError::InvalidCalibration(_))
        ));
        let zero_steps = SyringePumpAxisConfig::new(0.8, 0, 3.5, 240.0);
        assert!(zero_steps.check().is_err());
    }
}
