//! GPIO pin references and the controller contract.
//!
//! Devices name a pin as `(gpio_id, numbering, pin)`. Several devices may
//! reference the same controller; no two may claim the same pin. Board
//! (physical header) numbers are normalised to BCM numbers so conflicts are
//! detected regardless of which scheme each device used.

use crate::capabilities::DigitalOutput;
use crate::driver::ResourceClaim;
use crate::error::DeviceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Pin numbering scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinNumbering {
    /// Broadcom SoC channel numbers.
    #[default]
    Bcm,
    /// Physical pin numbers on the 40-pin header.
    Board,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpioError {
    #[error("board pin {0} is not a GPIO line")]
    NotAGpioPin(u8),

    #[error("BCM pin {0} is out of range (0-27)")]
    OutOfRange(u8),
}

/// Physical header pin -> BCM channel for the 40-pin header.
/// Power, ground and ID EEPROM pins are absent.
const BOARD_TO_BCM: &[(u8, u8)] = &[
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

const MAX_BCM_PIN: u8 = 27;

/// A logical output pin bound to a GPIO controller by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpioPinRef {
    /// Id of the `[[gpio]]` controller this pin lives on.
    #[serde(alias = "gpioID", alias = "gpio")]
    pub gpio_id: String,

    #[serde(default)]
    pub numbering: PinNumbering,

    pub pin: u8,

    /// Output is asserted by driving the line low.
    #[serde(default)]
    pub active_low: bool,
}

impl GpioPinRef {
    pub fn bcm(gpio_id: impl Into<String>, pin: u8) -> Self {
        Self {
            gpio_id: gpio_id.into(),
            numbering: PinNumbering::Bcm,
            pin,
            active_low: false,
        }
    }

    pub fn board(gpio_id: impl Into<String>, pin: u8) -> Self {
        Self {
            gpio_id: gpio_id.into(),
            numbering: PinNumbering::Board,
            pin,
            active_low: false,
        }
    }

    /// BCM channel this reference resolves to.
    pub fn bcm_pin(&self) -> Result<u8, GpioError> {
        match self.numbering {
            PinNumbering::Bcm if self.pin <= MAX_BCM_PIN => Ok(self.pin),
            PinNumbering::Bcm => Err(GpioError::OutOfRange(self.pin)),
            PinNumbering::Board => BOARD_TO_BCM
                .iter()
                .find(|(board, _)| *board == self.pin)
                .map(|(_, bcm)| *bcm)
                .ok_or(GpioError::NotAGpioPin(self.pin)),
        }
    }

    /// The exclusive resource this pin occupies.
    pub fn claim(&self) -> Result<ResourceClaim, GpioError> {
        Ok(ResourceClaim::GpioPin {
            gpio_id: self.gpio_id.clone(),
            bcm_pin: self.bcm_pin()?,
        })
    }
}

impl std::fmt::Display for GpioPinRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.numbering {
            PinNumbering::Bcm => "BCM",
            PinNumbering::Board => "BOARD",
        };
        write!(f, "{}:{}{}", self.gpio_id, scheme, self.pin)
    }
}

/// A GPIO controller that hands out output lines.
#[async_trait]
pub trait GpioController: Send + Sync {
    fn id(&self) -> &str;

    /// Configure `bcm_pin` as an output, initially inactive.
    async fn output(&self, bcm_pin: u8, active_low: bool) -> DeviceResult<Arc<dyn DigitalOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_pins_normalise_to_bcm() {
        assert_eq!(GpioPinRef::board("gpio0", 11).bcm_pin(), Ok(17));
        assert_eq!(GpioPinRef::board("gpio0", 40).bcm_pin(), Ok(21));
        assert_eq!(GpioPinRef::bcm("gpio0", 17).bcm_pin(), Ok(17));
    }

    #[test]
    fn power_pins_are_rejected() {
        assert_eq!(
            GpioPinRef::board("gpio0", 1).bcm_pin(),
            Err(GpioError::NotAGpioPin(1))
        );
        assert_eq!(
            GpioPinRef::bcm("gpio0", 40).bcm_pin(),
            Err(GpioError::OutOfRange(40))
        );
    }

    #[test]
    fn same_pin_in_both_schemes_claims_the_same_resource() {
        let a = GpioPinRef::board("gpio0", 11).claim().unwrap();
        let b = GpioPinRef::bcm("gpio0", 17).claim().unwrap();
        assert_eq!(a, b);
        let other_controller = GpioPinRef::bcm("gpio1", 17).claim().unwrap();
        assert_ne!(a, other_controller);
    }

    #[test]
    fn pin_ref_accepts_gpio_id_alias() {
        let pin: GpioPinRef = toml::from_str("gpioID = \"gpio0\"\npin = 22\n").unwrap();
        assert_eq!(pin.gpio_id, "gpio0");
        assert_eq!(pin.numbering, PinNumbering::Bcm);
        assert!(!pin.active_low);
    }
}
