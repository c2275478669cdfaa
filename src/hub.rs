use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ble::BtleplugPlatform,
    connection::{CollectionEvent, ConnectionManager},
    error::Result,
    events::{EventBus, TelemetryEvent},
    metrics::{MetricsEngine, SessionAccumulator, SessionMetrics},
    platform::{BlePlatform, GrantedPermissions, PermissionService},
    profiles::ProfileTable,
    scanner::{DeviceScanner, DiscoveryReceiver},
    types::{ConnectionSnapshot, Device, HubConfig, ScanFilterConfig, SensorReading, SensorType},
};

/// Latest readings and live sessions, written only by the collector task
#[derive(Debug, Default)]
struct TelemetryState {
    readings: HashMap<String, HashMap<SensorType, SensorReading>>,
    engine: MetricsEngine,
}

/// Entry point for a host application
///
/// ```no_run
/// use stridesense::{HubConfig, ScanFilterConfig, SensorHub, TelemetryEvent};
///
/// # async fn run() -> stridesense::Result<()> {
/// let hub = SensorHub::with_btleplug(HubConfig::default()).await?;
/// let mut events = hub.subscribe();
///
/// let mut discovered = hub.start_default_scan().await?;
/// if let Some(device) = discovered.recv().await {
///     hub.stop_scan().await?;
///     hub.connect_to_device(&device.id, true).await?;
/// }
///
/// while let Ok(event) = events.recv().await {
///     if let TelemetryEvent::MetricsUpdated(metrics) = event {
///         println!("{:.0} m, pace {:.0} s/km", metrics.distance_m, metrics.pace_seconds_per_km);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct SensorHub {
    config: HubConfig,
    scanner: DeviceScanner,
    manager: ConnectionManager,
    bus: EventBus,
    telemetry: Arc<RwLock<TelemetryState>>,
    collector: JoinHandle<()>,
}

impl SensorHub {
    /// Create a hub over a platform with the built-in profile table
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn PermissionService>,
        config: HubConfig,
    ) -> Self {
        Self::with_profiles(platform, permissions, ProfileTable::default(), config)
    }

    /// Create a hub with a custom profile table
    #[must_use]
    pub fn with_profiles(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn PermissionService>,
        profiles: ProfileTable,
        config: HubConfig,
    ) -> Self {
        let profiles = Arc::new(profiles);
        let bus = EventBus::new(config.event_capacity);
        let (collection_tx, collection_rx) = mpsc::unbounded_channel();

        let scanner = DeviceScanner::new(
            Arc::clone(&platform),
            Arc::clone(&permissions),
            Arc::clone(&profiles),
            bus.clone(),
        );
        let manager = ConnectionManager::new(
            platform,
            permissions,
            profiles,
            config.connection.clone(),
            bus.clone(),
            collection_tx,
        );

        let telemetry = Arc::new(RwLock::new(TelemetryState {
            readings: HashMap::new(),
            engine: MetricsEngine::new(config.runner),
        }));
        let collector = tokio::spawn(collect(
            collection_rx,
            Arc::clone(&telemetry),
            bus.clone(),
        ));

        Self {
            config,
            scanner,
            manager,
            bus,
            telemetry,
            collector,
        }
    }

    /// Create a hub on the first local Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`crate::SensorError::DeviceNotFound`] if no adapter is available,
    /// or [`crate::SensorError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn with_btleplug(config: HubConfig) -> Result<Self> {
        let platform = BtleplugPlatform::new().await?;
        Ok(Self::new(
            Arc::new(platform),
            Arc::new(GrantedPermissions),
            config,
        ))
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Start a scan window
    ///
    /// # Errors
    ///
    /// See [`DeviceScanner::start_scan`].
    pub async fn start_scan(
        &self,
        filter: ScanFilterConfig,
        duration_ms: u64,
    ) -> Result<DiscoveryReceiver> {
        self.scanner.start_scan(filter, duration_ms).await
    }

    /// Scan for everything for the configured scan duration
    ///
    /// # Errors
    ///
    /// See [`DeviceScanner::start_scan`].
    pub async fn start_default_scan(&self) -> Result<DiscoveryReceiver> {
        self.scanner
            .start_scan(ScanFilterConfig::default(), self.config.scan_duration_ms)
            .await
    }

    /// Stop the running scan, returning the admitted devices
    ///
    /// # Errors
    ///
    /// See [`DeviceScanner::stop_scan`].
    pub async fn stop_scan(&self) -> Result<Vec<Device>> {
        self.scanner.stop_scan().await
    }

    /// Devices seen by the current or last scan
    pub async fn discovered_devices(&self) -> Vec<Device> {
        self.scanner.devices().await
    }

    /// Connect to a device by identifier
    ///
    /// The device need not have been scanned; its type is then learned from
    /// the discovered services.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect_to_device(
        &self,
        device_id: &str,
        auto_reconnect: bool,
    ) -> Result<ConnectionSnapshot> {
        let device = match self.scanner.known_device(device_id).await {
            Some(device) => device,
            None => self
                .manager
                .snapshot(device_id)
                .await
                .map_or_else(|| Device::new(device_id), |snapshot| snapshot.device),
        };
        self.manager.connect(device, auto_reconnect).await
    }

    /// Disconnect a device
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::disconnect`].
    pub async fn disconnect_device(&self, device_id: &str) -> Result<()> {
        self.manager.disconnect(device_id).await
    }

    /// Register a telemetry consumer
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.bus.subscribe()
    }

    /// Latest decoded value per sensor type
    ///
    /// With no device given, the newest reading of each type across all
    /// devices is returned.
    pub async fn get_readings(&self, device_id: Option<&str>) -> HashMap<SensorType, SensorReading> {
        let telemetry = self.telemetry.read().await;
        match device_id {
            Some(device_id) => telemetry
                .readings
                .get(device_id)
                .cloned()
                .unwrap_or_default(),
            None => {
                let mut latest: HashMap<SensorType, SensorReading> = HashMap::new();
                for reading in telemetry.readings.values().flat_map(HashMap::values) {
                    let newer = latest
                        .get(&reading.sensor)
                        .is_none_or(|current| reading.received_at > current.received_at);
                    if newer {
                        latest.insert(reading.sensor, reading.clone());
                    }
                }
                latest
            }
        }
    }

    /// Cumulative totals of a device's running session
    pub async fn get_cumulative_metrics(&self, device_id: &str) -> Option<SessionAccumulator> {
        self.telemetry
            .read()
            .await
            .engine
            .accumulator(device_id)
            .cloned()
    }

    /// Totals plus the instantaneous derived metrics of a device's session
    pub async fn session_metrics(&self, device_id: &str) -> Option<SessionMetrics> {
        self.telemetry.read().await.engine.metrics(device_id)
    }

    /// Snapshot of one connection
    pub async fn connection(&self, device_id: &str) -> Option<ConnectionSnapshot> {
        self.manager.snapshot(device_id).await
    }

    /// Snapshots of every known connection
    pub async fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.manager.connections().await
    }

    /// Read a characteristic of a connected device
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::read_characteristic`].
    pub async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        self.manager
            .read_characteristic(device_id, service, characteristic)
            .await
    }

    /// Write a characteristic of a connected device
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::write_characteristic`].
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.manager
            .write_characteristic(device_id, service, characteristic, data, with_response)
            .await
    }

    /// Stop scanning and disconnect every device
    ///
    /// # Errors
    ///
    /// See [`DeviceScanner::stop_scan`].
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down sensor hub");
        self.scanner.stop_scan().await?;
        self.manager.shutdown().await;
        Ok(())
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        self.collector.abort();
    }
}

/// Apply collection events to the telemetry state and publish them
async fn collect(
    mut events: mpsc::UnboundedReceiver<CollectionEvent>,
    telemetry: Arc<RwLock<TelemetryState>>,
    bus: EventBus,
) {
    while let Some(event) = events.recv().await {
        match event {
            CollectionEvent::Started { device_id, at } => {
                telemetry.write().await.engine.start_session(&device_id, at);
            }
            CollectionEvent::Reading(reading) => {
                let metrics = {
                    let mut telemetry = telemetry.write().await;
                    telemetry
                        .readings
                        .entry(reading.device_id.clone())
                        .or_default()
                        .insert(reading.sensor, reading.clone());
                    telemetry.engine.ingest(&reading)
                };

                bus.publish(TelemetryEvent::Reading(reading));
                if let Some(metrics) = metrics {
                    bus.publish(TelemetryEvent::MetricsUpdated(metrics));
                }
            }
            CollectionEvent::Stopped { device_id } => {
                if let Some(totals) = telemetry.write().await.engine.end_session(&device_id) {
                    info!(
                        "Session for {} ended: {} steps, {:.1} m, TSS {:.1}",
                        device_id, totals.steps, totals.distance_m, totals.training_stress_score
                    );
                }
            }
        }
    }
    debug!("Collection channel closed");
}
