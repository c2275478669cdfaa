use thiserror::Error;

use crate::types::PermissionKind;

/// Errors that can occur when working with BLE running sensors
///
/// The type is `Clone` so that the outcome of a single connection attempt can be
/// handed to every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Bluetooth Low Energy platform error
    #[error("BLE error: {0}")]
    Ble(String),

    /// A runtime permission required for scanning or connecting was refused
    #[error("Permission denied: {permission}")]
    PermissionDenied {
        /// The permission that was refused
        permission: PermissionKind,
    },

    /// The platform connect did not complete in time
    #[error("Connection to {device_id} timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Device identifier
        device_id: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The platform connect primitive failed
    #[error("Failed to connect to {device_id}: {reason}")]
    ConnectionFailed {
        /// Device identifier
        device_id: String,
        /// Platform failure description
        reason: String,
    },

    /// Connected, but the GATT enumeration failed or came back empty
    #[error("Service discovery failed for {device_id}: {reason}")]
    ServiceDiscoveryFailed {
        /// Device identifier
        device_id: String,
        /// Failure description
        reason: String,
    },

    /// Automatic reconnection gave up
    #[error("Gave up reconnecting to {device_id} after {attempts} attempts")]
    MaxReconnectAttemptsExceeded {
        /// Device identifier
        device_id: String,
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// A telemetry buffer was too short for its fixed layout
    #[error("Malformed {frame} frame: {actual} bytes, expected at least {expected}")]
    MalformedFrame {
        /// Decoder that rejected the buffer
        frame: &'static str,
        /// Minimum length the layout needs
        expected: usize,
        /// Length actually received
        actual: usize,
    },

    /// Device is unknown to the scanner and the manager
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current invalid state description
        state: String,
    },

    /// Device is not connected
    #[error("Device disconnected")]
    Disconnected,

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

impl From<btleplug::Error> for SensorError {
    fn from(error: btleplug::Error) -> Self {
        Self::Ble(error.to_string())
    }
}

/// Result type for sensor operations
pub type Result<T> = std::result::Result<T, SensorError>;

impl SensorError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionFailed { .. }
                | Self::ServiceDiscoveryFailed { .. }
                | Self::Disconnected
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if the caller may simply try again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionFailed { .. }
                | Self::ServiceDiscoveryFailed { .. }
                | Self::MalformedFrame { .. }
        )
    }

    /// Check if this error requires explicit caller action before anything else happens
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::MaxReconnectAttemptsExceeded { .. }
        )
    }
}
