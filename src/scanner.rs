use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SensorError},
    events::{EventBus, TelemetryEvent},
    platform::{ensure_permissions, BlePlatform, PermissionService},
    profiles::ProfileTable,
    types::{Advertisement, Device, PermissionKind, ScanFilterConfig},
};

/// Receiver of devices admitted during a scan; closes when the scan stops
pub type DiscoveryReceiver = mpsc::UnboundedReceiver<Device>;

struct ActiveScan {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Vec<Device>>,
}

/// Advertisement scanner
///
/// Merges repeated sightings by device identifier, classifies every device
/// against the [`ProfileTable`] and reports the ones admitted by the filter,
/// both on the returned [`DiscoveryReceiver`] and as
/// [`TelemetryEvent::DeviceDiscovered`].
pub struct DeviceScanner {
    platform: Arc<dyn BlePlatform>,
    permissions: Arc<dyn PermissionService>,
    profiles: Arc<ProfileTable>,
    bus: EventBus,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    active: Mutex<Option<ActiveScan>>,
}

impl DeviceScanner {
    /// Create a scanner
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn PermissionService>,
        profiles: Arc<ProfileTable>,
        bus: EventBus,
    ) -> Self {
        Self {
            platform,
            permissions,
            profiles,
            bus,
            devices: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(None),
        }
    }

    /// Start a scan window of `duration_ms`
    ///
    /// Devices seen by a previous scan are discarded. The window closes on its
    /// own after `duration_ms`, publishing [`TelemetryEvent::ScanStopped`].
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::PermissionDenied`] if scanning is not permitted,
    /// [`SensorError::InvalidState`] if a scan is already running,
    /// or [`SensorError::Ble`] if the platform refuses to start scanning.
    pub async fn start_scan(
        &self,
        filter: ScanFilterConfig,
        duration_ms: u64,
    ) -> Result<DiscoveryReceiver> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|scan| !scan.task.is_finished()) {
            return Err(SensorError::InvalidState {
                state: "a scan is already running".to_string(),
            });
        }

        ensure_permissions(
            self.permissions.as_ref(),
            &[PermissionKind::BluetoothScan, PermissionKind::Location],
        )
        .await?;

        self.devices.lock().await.clear();
        let advertisements = self.platform.start_scan(&filter).await?;

        info!("Starting BLE scan for {}ms", duration_ms);
        self.bus.publish(TelemetryEvent::ScanStarted { duration_ms });

        let (discovered_tx, discovered_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let session = ScanSession {
            platform: Arc::clone(&self.platform),
            profiles: Arc::clone(&self.profiles),
            bus: self.bus.clone(),
            devices: Arc::clone(&self.devices),
            filter,
            discovered: discovered_tx,
        };

        let task = tokio::spawn(session.run(
            advertisements,
            stop_rx,
            Duration::from_millis(duration_ms),
        ));
        *active = Some(ActiveScan {
            stop: stop_tx,
            task,
        });

        Ok(discovered_rx)
    }

    /// Stop the running scan early
    ///
    /// Platform advertisement delivery has stopped by the time this returns.
    /// Returns the devices admitted during the scan; when no scan is running the
    /// admitted devices of the last scan are returned and no event is published.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Other`] if the scan task panicked.
    pub async fn stop_scan(&self) -> Result<Vec<Device>> {
        let scan = self.active.lock().await.take();
        let Some(scan) = scan else {
            return Ok(self.devices().await);
        };

        // Fails harmlessly when the window already closed on its own
        let _ = scan.stop.send(());
        scan.task
            .await
            .map_err(|e| SensorError::Other(format!("Scan task failed: {e}")))
    }

    /// Check whether a scan window is open
    pub async fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|scan| !scan.task.is_finished())
    }

    /// Every device seen by the current or last scan, strongest signal first
    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().await.values().cloned().collect();
        sort_by_signal(&mut devices);
        devices
    }

    /// Look up a device seen by the current or last scan
    pub async fn known_device(&self, device_id: &str) -> Option<Device> {
        self.devices.lock().await.get(device_id).cloned()
    }
}

fn sort_by_signal(devices: &mut [Device]) {
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
}

/// State owned by one running scan window
struct ScanSession {
    platform: Arc<dyn BlePlatform>,
    profiles: Arc<ProfileTable>,
    bus: EventBus,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    filter: ScanFilterConfig,
    discovered: mpsc::UnboundedSender<Device>,
}

impl ScanSession {
    async fn run(
        self,
        mut advertisements: mpsc::UnboundedReceiver<Advertisement>,
        mut stop: oneshot::Receiver<()>,
        duration: Duration,
    ) -> Vec<Device> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let mut reported = HashSet::new();
        let mut delivering = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Scan stopped by caller");
                    break;
                }
                () = &mut deadline => {
                    info!("Scan window elapsed");
                    break;
                }
                advertisement = advertisements.recv(), if delivering => match advertisement {
                    Some(advertisement) => self.handle(advertisement, &mut reported).await,
                    None => {
                        debug!("Platform advertisement stream closed");
                        delivering = false;
                    }
                },
            }
        }

        if let Err(e) = self.platform.stop_scan().await {
            warn!("Failed to stop platform scan: {}", e);
        }
        drop(advertisements);

        let mut admitted: Vec<Device> = self
            .devices
            .lock()
            .await
            .values()
            .filter(|device| self.filter.admits(device))
            .cloned()
            .collect();
        sort_by_signal(&mut admitted);

        info!("Scan completed. Found {} device(s)", admitted.len());
        self.bus.publish(TelemetryEvent::ScanStopped {
            devices: admitted.clone(),
        });
        admitted
    }

    async fn handle(&self, advertisement: Advertisement, reported: &mut HashSet<String>) {
        let device = {
            let mut devices = self.devices.lock().await;
            let device = devices
                .entry(advertisement.device_id.clone())
                .or_insert_with(|| Device::new(advertisement.device_id.clone()));
            merge_advertisement(device, advertisement, &self.profiles);
            device.clone()
        };

        if !self.filter.admits(&device) {
            return;
        }

        let first_sighting = reported.insert(device.id.clone());
        if !first_sighting && !self.filter.allow_duplicate_reports {
            return;
        }

        if first_sighting {
            info!(
                "Found {} device: {} (RSSI {})",
                device.device_type,
                device.display_name(),
                device.rssi
            );
        }

        let _ = self.discovered.send(device.clone());
        self.bus.publish(TelemetryEvent::DeviceDiscovered(device));
    }
}

/// Fold one advertisement into the merged device record and reclassify it
fn merge_advertisement(device: &mut Device, advertisement: Advertisement, profiles: &ProfileTable) {
    device.rssi = advertisement.rssi;
    if advertisement.name.is_some() {
        device.name = advertisement.name;
    }
    device.services.extend(advertisement.services);
    device.last_seen = SystemTime::now();
    device.device_type = profiles.classify(&device.services, device.name.as_deref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::GrantedPermissions,
        profiles::{HEART_RATE_SERVICE_UUID, RUNNING_POWER_SERVICE_UUID},
        testing::{DeniedPermissions, MockPlatform},
        types::DeviceType,
    };
    use tokio::time::Instant;
    use tokio_test::assert_err;

    fn scanner(platform: &Arc<MockPlatform>) -> (DeviceScanner, EventBus) {
        let bus = EventBus::new(64);
        let scanner = DeviceScanner::new(
            Arc::clone(platform) as Arc<dyn BlePlatform>,
            Arc::new(GrantedPermissions),
            Arc::new(ProfileTable::default()),
            bus.clone(),
        );
        (scanner, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scan_stops_after_duration() {
        let platform = Arc::new(MockPlatform::new());
        let (scanner, bus) = scanner(&platform);
        let mut events = bus.subscribe();

        let started = Instant::now();
        let mut discovered = scanner
            .start_scan(ScanFilterConfig::default(), 5_000)
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            TelemetryEvent::ScanStarted { duration_ms: 5_000 }
        ));
        match events.recv().await.unwrap() {
            TelemetryEvent::ScanStopped { devices } => assert!(devices.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(5_000));

        // No discovery after the window closed
        assert!(!platform.advertise("late", Some("HRM"), -40, &[]));
        assert!(discovered.recv().await.is_none());
        assert_eq!(platform.scans_stopped(), 1);
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_classify_and_deduplicate() {
        let platform = Arc::new(MockPlatform::new());
        let (scanner, _bus) = scanner(&platform);
        let mut discovered = scanner
            .start_scan(ScanFilterConfig::default(), 10_000)
            .await
            .unwrap();

        assert!(platform.advertise("strap", None, -70, &[]));
        let device = discovered.recv().await.unwrap();
        assert_eq!(device.device_type, DeviceType::Unknown);

        // Repeat sightings update the record but are not reported again
        assert!(platform.advertise("strap", Some("Polar H10"), -55, &[HEART_RATE_SERVICE_UUID]));
        assert!(platform.advertise("pod", Some("Stryd"), -80, &[]));
        let device = discovered.recv().await.unwrap();
        assert_eq!(device.id, "pod");
        assert_eq!(device.device_type, DeviceType::Power);

        let strap = scanner.known_device("strap").await.unwrap();
        assert_eq!(strap.rssi, -55);
        assert_eq!(strap.name.as_deref(), Some("Polar H10"));
        assert_eq!(strap.device_type, DeviceType::HeartRate);

        let devices = scanner.stop_scan().await.unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["strap", "pod"]);
        assert!(discovered.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_and_duplicate_reports() {
        let platform = Arc::new(MockPlatform::new());
        let (scanner, _bus) = scanner(&platform);
        let filter = ScanFilterConfig {
            service_ids: vec![RUNNING_POWER_SERVICE_UUID],
            min_signal_strength: Some(-75),
            allow_duplicate_reports: true,
            ..Default::default()
        };
        let mut discovered = scanner.start_scan(filter, 10_000).await.unwrap();

        platform.advertise("strap", Some("HRM-Pro"), -50, &[HEART_RATE_SERVICE_UUID]);
        platform.advertise("far-pod", None, -90, &[RUNNING_POWER_SERVICE_UUID]);
        platform.advertise("pod", None, -60, &[RUNNING_POWER_SERVICE_UUID]);
        platform.advertise("pod", None, -58, &[]);

        assert_eq!(discovered.recv().await.unwrap().rssi, -60);
        assert_eq!(discovered.recv().await.unwrap().rssi, -58);

        let admitted = scanner.stop_scan().await.unwrap();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, "pod");
        assert_eq!(scanner.devices().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_emits_collected_devices() {
        let platform = Arc::new(MockPlatform::new());
        let (scanner, bus) = scanner(&platform);
        let mut events = bus.subscribe();
        let mut discovered = scanner
            .start_scan(ScanFilterConfig::default(), 60_000)
            .await
            .unwrap();

        platform.advertise("strap", Some("TICKR"), -60, &[]);
        discovered.recv().await.unwrap();

        let started = Instant::now();
        let devices = scanner.stop_scan().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(platform.scans_stopped(), 1);

        let mut stopped = None;
        while let Ok(event) = events.try_recv() {
            if let TelemetryEvent::ScanStopped { devices } = event {
                stopped = Some(devices);
            }
        }
        assert_eq!(stopped.map(|d| d.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_is_rejected_and_new_scan_discards_old_devices() {
        let platform = Arc::new(MockPlatform::new());
        let (scanner, _bus) = scanner(&platform);
        let mut first = scanner
            .start_scan(ScanFilterConfig::default(), 1_000)
            .await
            .unwrap();
        platform.advertise("strap", Some("HRM"), -60, &[]);
        first.recv().await.unwrap();

        let error = assert_err!(scanner.start_scan(ScanFilterConfig::default(), 1_000).await);
        assert!(matches!(error, SensorError::InvalidState { .. }));

        scanner.stop_scan().await.unwrap();
        assert!(scanner.known_device("strap").await.is_some());

        let _second = scanner
            .start_scan(ScanFilterConfig::default(), 1_000)
            .await
            .unwrap();
        assert!(scanner.known_device("strap").await.is_none());
        assert_eq!(platform.scans_started(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_is_synchronous() {
        let platform = Arc::new(MockPlatform::new());
        let scanner = DeviceScanner::new(
            Arc::clone(&platform) as Arc<dyn BlePlatform>,
            Arc::new(DeniedPermissions::new(PermissionKind::Location)),
            Arc::new(ProfileTable::default()),
            EventBus::default(),
        );

        let error = assert_err!(scanner.start_scan(ScanFilterConfig::default(), 1_000).await);
        assert_eq!(
            error,
            SensorError::PermissionDenied {
                permission: PermissionKind::Location
            }
        );
        assert_eq!(platform.scans_started(), 0);
    }
}
