use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::{Duration, SystemTime},
};
use uuid::Uuid;

/// Runtime permission required by some platforms before scanning or connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    /// Permission to scan for advertisements
    BluetoothScan,
    /// Permission to open GATT connections
    BluetoothConnect,
    /// Location access, required for scanning on mobile platforms
    Location,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BluetoothScan => write!(f, "Bluetooth scan"),
            Self::BluetoothConnect => write!(f, "Bluetooth connect"),
            Self::Location => write!(f, "Location"),
        }
    }
}

/// Sensor classification derived from advertised services or the device name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Heart-rate strap or optical sensor
    HeartRate,
    /// Running power pod
    Power,
    /// Foot pod reporting running dynamics
    FootPod,
    /// Cadence sensor
    Cadence,
    /// Not recognised
    Unknown,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::Power => write!(f, "Power"),
            Self::FootPod => write!(f, "Foot Pod"),
            Self::Cadence => write!(f, "Cadence"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A BLE peripheral observed during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Platform-stable opaque identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Advertised service UUIDs
    pub services: BTreeSet<Uuid>,
    /// Classified sensor type
    pub device_type: DeviceType,
    /// Last time an advertisement was received
    pub last_seen: SystemTime,
}

impl Device {
    /// Create a device that has not been classified yet
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: 0,
            services: BTreeSet::new(),
            device_type: DeviceType::Unknown,
            last_seen: SystemTime::now(),
        }
    }

    /// Name for log output, falling back to the identifier
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// One advertisement report delivered by the platform while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform-stable opaque identifier
    pub device_id: String,
    /// Advertised local name, if present in this report
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Service UUIDs carried by this report
    pub services: Vec<Uuid>,
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Known but never connected
    Idle,
    /// Platform connect or service discovery in progress
    Connecting,
    /// Link up, services discovered and decoders attached
    Connected,
    /// Caller-requested teardown in progress
    Disconnecting,
    /// Link down and no automatic reconnect pending
    Disconnected,
    /// Waiting for the backoff before an automatic reconnect
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Discovered services and their characteristics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattSignature {
    /// Service UUID to characteristic UUIDs
    pub services: BTreeMap<Uuid, BTreeSet<Uuid>>,
}

impl GattSignature {
    /// Add a characteristic under its service
    pub fn insert(&mut self, service: Uuid, characteristic: Uuid) {
        self.services.entry(service).or_default().insert(characteristic);
    }

    /// Add a service without characteristics
    pub fn insert_service(&mut self, service: Uuid) {
        self.services.entry(service).or_default();
    }

    /// True when nothing was discovered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Service UUIDs in the signature
    #[must_use]
    pub fn service_ids(&self) -> BTreeSet<Uuid> {
        self.services.keys().copied().collect()
    }

    /// All `(service, characteristic)` pairs
    pub fn characteristics(&self) -> impl Iterator<Item = (Uuid, Uuid)> + '_ {
        self.services
            .iter()
            .flat_map(|(service, chars)| chars.iter().map(move |c| (*service, *c)))
    }

    /// Check whether a characteristic is present under a service
    #[must_use]
    pub fn contains(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services
            .get(&service)
            .is_some_and(|chars| chars.contains(&characteristic))
    }
}

/// Kind of value carried by a [`SensorReading`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorType {
    /// Beats per minute
    HeartRate,
    /// Watts
    Power,
    /// Steps per minute
    Cadence,
    /// Centimeters
    StrideLength,
    /// Centimeters
    VerticalOscillation,
    /// Milliseconds
    GroundContactTime,
    /// Watts
    FormPower,
    /// Percent
    Battery,
    /// Cumulative steps reported by the pod
    StepCount,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::Power => write!(f, "Power"),
            Self::Cadence => write!(f, "Cadence"),
            Self::StrideLength => write!(f, "Stride Length"),
            Self::VerticalOscillation => write!(f, "Vertical Oscillation"),
            Self::GroundContactTime => write!(f, "Ground Contact Time"),
            Self::FormPower => write!(f, "Form Power"),
            Self::Battery => write!(f, "Battery"),
            Self::StepCount => write!(f, "Step Count"),
        }
    }
}

/// One decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// What the value measures
    pub sensor: SensorType,
    /// The value in the unit documented on [`SensorType`]
    pub value: f64,
    /// Originating device
    pub device_id: String,
    /// Wall-clock receipt time
    pub received_at: SystemTime,
}

impl SensorReading {
    /// Create a new reading
    #[must_use]
    pub fn new(
        sensor: SensorType,
        value: f64,
        device_id: impl Into<String>,
        received_at: SystemTime,
    ) -> Self {
        Self {
            sensor,
            value,
            device_id: device_id.into(),
            received_at,
        }
    }
}

/// Advertisement filter applied by the scanner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilterConfig {
    /// Case-insensitive substring the name must contain
    pub name_prefix: Option<String>,
    /// Any of these services must be advertised; empty admits everything
    pub service_ids: Vec<Uuid>,
    /// Minimum signal strength in dBm
    pub min_signal_strength: Option<i16>,
    /// Report a device on every sighting instead of once per scan
    pub allow_duplicate_reports: bool,
}

impl ScanFilterConfig {
    /// Check whether a device passes the filter
    #[must_use]
    pub fn admits(&self, device: &Device) -> bool {
        if let Some(prefix) = &self.name_prefix {
            let needle = prefix.to_lowercase();
            let matches = device
                .name
                .as_ref()
                .is_some_and(|name| name.to_lowercase().contains(&needle));
            if !matches {
                return false;
            }
        }

        if !self.service_ids.is_empty()
            && !self.service_ids.iter().any(|s| device.services.contains(s))
        {
            return false;
        }

        if let Some(floor) = self.min_signal_strength {
            if device.rssi < floor {
                return false;
            }
        }

        true
    }
}

/// Immutable view of a managed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Device the connection belongs to
    pub device: Device,
    /// Current state
    pub state: ConnectionState,
    /// Automatic reconnect attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Whether unsolicited drops are followed by reconnects
    pub auto_reconnect: bool,
    /// Discovered GATT layout, empty unless connected
    pub gatt: GattSignature,
}

impl ConnectionSnapshot {
    /// Device identifier
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// True when the link is up and usable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Runner physiology used by the derived metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunnerProfile {
    /// Body weight in kilograms
    pub weight_kg: f64,
    /// Functional threshold power in watts
    pub ftp_watts: f64,
}

impl Default for RunnerProfile {
    fn default() -> Self {
        Self {
            weight_kg: 70.0,
            ftp_watts: 250.0,
        }
    }
}

/// Connection manager timing and retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Platform connect timeout in milliseconds
    pub timeout_ms: u64,
    /// Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each automatic reconnect in milliseconds
    pub reconnect_delay_ms: u64,
}

impl ConnectionConfig {
    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reconnect delay as a [`Duration`]
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
        }
    }
}

/// Top-level configuration supplied by the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Runner physiology
    pub runner: RunnerProfile,
    /// Connection behaviour
    pub connection: ConnectionConfig,
    /// Default scan window in milliseconds
    pub scan_duration_ms: u64,
    /// Capacity of the telemetry broadcast channel
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            runner: RunnerProfile::default(),
            connection: ConnectionConfig::default(),
            scan_duration_ms: 10_000,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{HEART_RATE_SERVICE_UUID, RUNNING_SPEED_CADENCE_SERVICE_UUID};

    fn strap(rssi: i16) -> Device {
        let mut device = Device::new("C0:FF:EE:00:00:01");
        device.name = Some("Polar H10 1A2B3C".to_string());
        device.rssi = rssi;
        device.services.insert(HEART_RATE_SERVICE_UUID);
        device
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert!((config.runner.weight_kg - 70.0).abs() < f64::EPSILON);
        assert!((config.runner.ftp_watts - 250.0).abs() < f64::EPSILON);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.timeout(), Duration::from_secs(10));
        assert_eq!(config.connection.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.scan_duration_ms, 10_000);
    }

    #[test]
    fn test_filter_name_is_case_insensitive_substring() {
        let filter = ScanFilterConfig {
            name_prefix: Some("h10".to_string()),
            ..Default::default()
        };
        assert!(filter.admits(&strap(-60)));

        let filter = ScanFilterConfig {
            name_prefix: Some("stryd".to_string()),
            ..Default::default()
        };
        assert!(!filter.admits(&strap(-60)));
        assert!(!filter.admits(&Device::new("anonymous")));
    }

    #[test]
    fn test_filter_services_and_signal_floor() {
        let any_of = ScanFilterConfig {
            service_ids: vec![RUNNING_SPEED_CADENCE_SERVICE_UUID, HEART_RATE_SERVICE_UUID],
            ..Default::default()
        };
        assert!(any_of.admits(&strap(-60)));

        let foot_pods_only = ScanFilterConfig {
            service_ids: vec![RUNNING_SPEED_CADENCE_SERVICE_UUID],
            ..Default::default()
        };
        assert!(!foot_pods_only.admits(&strap(-60)));

        let near = ScanFilterConfig {
            min_signal_strength: Some(-70),
            ..Default::default()
        };
        assert!(near.admits(&strap(-70)));
        assert!(!near.admits(&strap(-85)));
    }

    #[test]
    fn test_gatt_signature() {
        let mut gatt = GattSignature::default();
        assert!(gatt.is_empty());

        let service = HEART_RATE_SERVICE_UUID;
        let characteristic = crate::profiles::HEART_RATE_MEASUREMENT_UUID;
        gatt.insert(service, characteristic);

        assert!(!gatt.is_empty());
        assert!(gatt.contains(service, characteristic));
        assert_eq!(gatt.characteristics().count(), 1);
        assert!(gatt.service_ids().contains(&service));
    }
}
