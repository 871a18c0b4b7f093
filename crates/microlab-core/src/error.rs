//! Error types for the microlab core.
//!
//! Two layers of errors exist:
//!
//! - **`DriverError`**: produced by device implementations. Carries a
//!   [`DriverErrorKind`] which decides whether the failure is worth retrying
//!   (a busy 1-wire bus, a serial timeout) or not (a bad volume, a motion
//!   controller alarm).
//! - **`LabError`**: the application-level taxonomy used by the registry, the
//!   control loop and the task execution layer. Every variant maps onto an
//!   [`ErrorClass`], which is what task status reports.
//!
//! ## Error classes
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | `configuration` | dependency cycle, duplicate id, pin conflict | fatal at start-up |
//! | `transient` | I/O timeout, checksum failure, busy bus | retried with backoff |
//! | `permanent` | invalid parameters, device fault, unknown device | failed immediately |
//! | `resource_contention` | device locked by another operation | caller retries later |
//! | `cancelled` | task cancelled before it ran | terminal |

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// What went wrong inside a device implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Device could not be brought up.
    Initialization,
    /// Parameters rejected at build time.
    Configuration,
    /// Link-level failure (serial I/O, sysfs read, bus busy).
    Communication,
    /// Data arrived but failed its integrity check.
    Checksum,
    /// No reply within the allowed time.
    Timeout,
    /// The device reported a fault state (alarm, error reply).
    Hardware,
    /// Insufficient permissions for the underlying file or port.
    Permission,
    /// Operation parameters out of range or malformed.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl DriverErrorKind {
    /// Whether an operation failing with this kind may succeed when repeated.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DriverErrorKind::Communication | DriverErrorKind::Checksum | DriverErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Checksum => "checksum",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Permission => "permission",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by every capability operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Timeout, message)
    }

    pub fn communication(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Communication, message)
    }

    pub fn hardware(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Hardware, message)
    }

    pub fn invalid_parameter(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::InvalidParameter, message)
    }

    /// Map an I/O error onto a driver error, keeping timeouts and permission
    /// problems distinguishable.
    pub fn from_io(driver_type: impl Into<String>, context: &str, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DriverErrorKind::Timeout
            }
            std::io::ErrorKind::PermissionDenied => DriverErrorKind::Permission,
            _ => DriverErrorKind::Communication,
        };
        Self::new(driver_type, kind, format!("{}: {}", context, err))
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Result type for capability operations.
pub type DeviceResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Error Classification
// =============================================================================

/// Coarse classification reported in task status and used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    Transient,
    Permanent,
    ResourceContention,
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::ResourceContention => "resource_contention",
            ErrorClass::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Application Errors
// =============================================================================

/// Convenience alias for results using the application error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for the microlab core.
#[derive(Error, Debug)]
pub enum LabError {
    /// Configuration is structurally or semantically invalid.
    ///
    /// Raised only during start-up: dependency cycles, duplicate ids, unknown
    /// implementations, unresolved dependencies, pin or port conflicts.
    /// The core refuses to start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No device with this id exists in the registry.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// The device exists but does not provide the requested capability.
    #[error("Device '{device_id}' does not provide capability '{capability}'")]
    CapabilityMismatch {
        device_id: String,
        capability: String,
    },

    /// Operation parameters could not be interpreted.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A device operation failed.
    ///
    /// Whether this is retried depends on the wrapped [`DriverErrorKind`].
    #[error("Device '{device_id}' failed: {source}")]
    Device {
        device_id: String,
        #[source]
        source: DriverError,
    },

    /// Another in-flight operation holds the device.
    #[error("Device '{device_id}' is busy with another operation")]
    ResourceContention { device_id: String },

    /// Task store failure.
    #[error("Task store error: {0}")]
    Storage(String),

    /// The referenced task does not exist.
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    /// Operation was cancelled before it ran.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// Wrap a driver error with the id of the device that produced it.
    pub fn device(device_id: impl Into<String>, source: DriverError) -> Self {
        Self::Device {
            device_id: device_id.into(),
            source,
        }
    }

    /// Classify this error for retry decisions and status reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            LabError::Configuration(_) => ErrorClass::Configuration,
            LabError::Device { source, .. } if source.is_transient() => ErrorClass::Transient,
            LabError::Io(_) => ErrorClass::Transient,
            LabError::ResourceContention { .. } => ErrorClass::ResourceContention,
            LabError::Cancelled(_) => ErrorClass::Cancelled,
            LabError::UnknownDevice(_)
            | LabError::CapabilityMismatch { .. }
            | LabError::InvalidParameters(_)
            | LabError::Device { .. }
            | LabError::Storage(_)
            | LabError::TaskNotFound(_) => ErrorClass::Permanent,
        }
    }

    /// Whether repeating the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::ResourceContention
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(DriverErrorKind::Timeout.is_transient());
        assert!(DriverErrorKind::Checksum.is_transient());
        assert!(DriverErrorKind::Communication.is_transient());
        assert!(!DriverErrorKind::InvalidParameter.is_transient());
        assert!(!DriverErrorKind::Hardware.is_transient());
    }

    #[test]
    fn device_error_classification_follows_driver_kind() {
        let transient = LabError::device("thermo", DriverError::timeout("ds18b20", "no reply"));
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(transient.is_retryable());

        let permanent = LabError::device(
            "pump",
            DriverError::invalid_parameter("gcode", "negative volume"),
        );
        assert_eq!(permanent.class(), ErrorClass::Permanent);
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn unknown_device_is_permanent() {
        let err = LabError::UnknownDevice("nope".into());
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(err.to_string(), "Unknown device 'nope'");
    }

    #[test]
    fn io_errors_map_to_driver_kinds() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            DriverError::from_io("x", "read", &timed_out).kind,
            DriverErrorKind::Timeout
        );
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(
            DriverError::from_io("x", "read", &denied).kind,
            DriverErrorKind::Permission
        );
    }

    #[test]
    fn error_class_serde() {
        let json = serde_json::to_string(&ErrorClass::ResourceContention).unwrap();
        assert_eq!(json, "\"resource_contention\"");
    }
}
