#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Stridesense 🏃
//!
//! A Rust library for connecting to Bluetooth Low Energy running sensors and
//! turning their notifications into live running metrics.
//!
//! Supported sensors are heart-rate straps (standard Heart Rate service),
//! foot pods and running power meters (standard Running Speed and Cadence,
//! Cycling Power and the vendor running power/dynamics services). The library
//! scans, classifies and connects to them, reconnects after dropouts, decodes
//! their frames and derives distance, pace, training stress, leg-spring
//! stiffness and running efficiency.
//!
//! ## Architecture
//!
//! - [`scanner::DeviceScanner`] merges advertisements into classified [`Device`]s
//! - [`connection::ConnectionManager`] owns the per-device connection state machine
//! - [`protocol`] holds the stateless frame decoders
//! - [`metrics::MetricsEngine`] accumulates per-session running metrics
//! - [`events::EventBus`] fans [`TelemetryEvent`]s out to any number of consumers
//! - [`SensorHub`] ties them together for the host application
//!
//! The radio is reached only through the [`BlePlatform`] trait;
//! [`BtleplugPlatform`] implements it on desktop Bluetooth stacks.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stridesense::{HubConfig, SensorHub, SensorType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = SensorHub::with_btleplug(HubConfig::default()).await?;
//!
//!     // Scan and connect to the first sensor found
//!     let mut discovered = hub.start_default_scan().await?;
//!     if let Some(device) = discovered.recv().await {
//!         hub.stop_scan().await?;
//!         hub.connect_to_device(&device.id, true).await?;
//!     }
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     if let Some(hr) = hub.get_readings(None).await.get(&SensorType::HeartRate) {
//!         println!("Heart rate: {} bpm", hr.value);
//!     }
//!
//!     hub.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy platform backed by btleplug
pub mod ble;
/// Connection state machine and decoder attachment
pub mod connection;
/// Error types and handling
pub mod error;
/// Telemetry event bus
///
/// Slow receivers observe a lag instead of blocking publishers.
pub mod events;
/// Host-facing facade
pub mod hub;
/// Session accumulators and derived running metrics
///
/// Steps, distance and training stress are integrated per collection session;
/// pace, leg-spring stiffness and efficiency come from the latest inputs.
pub mod metrics;
/// Platform and permission collaborator traits
///
/// The scanner and connection manager reach the radio only through
/// [`platform::BlePlatform`].
pub mod platform;
/// Known GATT services and device classification
///
/// Service matches are authoritative; name patterns are a fallback.
pub mod profiles;
/// Sensor frame decoders
pub mod protocol;
/// Advertisement scanning
pub mod scanner;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::BtleplugPlatform;
pub use error::{Result, SensorError};
pub use events::{EventBus, TelemetryEvent};
pub use hub::SensorHub;
pub use metrics::{SessionAccumulator, SessionMetrics};
pub use platform::{BlePlatform, GrantedPermissions, PermissionService};
pub use profiles::ProfileTable;
pub use types::{
    ConnectionConfig, ConnectionSnapshot, ConnectionState, Device, DeviceType, HubConfig,
    PermissionKind, RunnerProfile, ScanFilterConfig, SensorReading, SensorType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
