use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{collections::HashMap, sync::Arc, time::SystemTime};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SensorError},
    events::{EventBus, TelemetryEvent},
    platform::{ensure_permissions, BlePlatform, PeripheralHandle, PermissionService, Subscription},
    profiles::{ProfileTable, BATTERY_LEVEL_UUID},
    protocol::FrameKind,
    types::{
        ConnectionConfig, ConnectionSnapshot, ConnectionState, Device, GattSignature,
        PermissionKind, SensorReading,
    },
};

/// Input to the telemetry pipeline, in per-device order
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    /// Decoders attached; a session starts
    Started {
        /// Device identifier
        device_id: String,
        /// Time collection started
        at: SystemTime,
    },
    /// A decoded value
    Reading(SensorReading),
    /// Decoders detached; the session ends
    Stopped {
        /// Device identifier
        device_id: String,
    },
}

type AttemptFuture = Shared<BoxFuture<'static, Result<ConnectionSnapshot>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOrigin {
    Caller,
    Reconnect,
}

/// A subscribed characteristic and the task pumping its frames
struct AttachedDecoder {
    kind: FrameKind,
    service: Uuid,
    characteristic: Uuid,
    task: JoinHandle<()>,
}

/// Link resources produced by a successful attempt
struct EstablishedLink {
    handle: PeripheralHandle,
    gatt: GattSignature,
    decoders: Vec<AttachedDecoder>,
}

struct ConnectionEntry {
    device: Device,
    state: ConnectionState,
    gatt: GattSignature,
    handle: Option<PeripheralHandle>,
    reconnect_attempts: u32,
    auto_reconnect: bool,
    in_flight: Option<AttemptFuture>,
    decoders: Vec<AttachedDecoder>,
    monitor: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    // Bumped on every connect and teardown so stale link monitors are ignored
    generation: u64,
}

impl ConnectionEntry {
    fn new(device: Device) -> Self {
        Self {
            device,
            state: ConnectionState::Idle,
            gatt: GattSignature::default(),
            handle: None,
            reconnect_attempts: 0,
            auto_reconnect: false,
            in_flight: None,
            decoders: Vec::new(),
            monitor: None,
            reconnect_task: None,
            generation: 0,
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            device: self.device.clone(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            auto_reconnect: self.auto_reconnect,
            gatt: self.gatt.clone(),
        }
    }
}

struct ManagerInner {
    platform: Arc<dyn BlePlatform>,
    permissions: Arc<dyn PermissionService>,
    profiles: Arc<ProfileTable>,
    config: ConnectionConfig,
    bus: EventBus,
    collection: mpsc::UnboundedSender<CollectionEvent>,
    table: Mutex<HashMap<String, ConnectionEntry>>,
}

/// Owner of every device connection
///
/// The manager is the only place connection entries are mutated; callers get
/// [`ConnectionSnapshot`]s and [`TelemetryEvent`]s. Cloning the manager yields
/// another handle to the same connection table.
///
/// # State machine
///
/// ```text
/// Idle -> Connecting -> Connected -> Disconnecting -> Disconnected
///               ^                        |
///               |    (drop, auto)        v
///               +------------------ Reconnecting -> Disconnected (attempts exhausted)
/// ```
///
/// At most one connect attempt runs per device; concurrent callers share it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager
    ///
    /// Decoded readings and session boundaries are sent to `collection`.
    #[must_use]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permissions: Arc<dyn PermissionService>,
        profiles: Arc<ProfileTable>,
        config: ConnectionConfig,
        bus: EventBus,
        collection: mpsc::UnboundedSender<CollectionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                platform,
                permissions,
                profiles,
                config,
                bus,
                collection,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connection configuration in use
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Connect to a device, or join the attempt already running for it
    ///
    /// Returns immediately when the device is already connected. A successful
    /// connect resets the reconnect counter and publishes
    /// [`TelemetryEvent::DeviceConnected`].
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::PermissionDenied`] if connecting is not permitted,
    /// [`SensorError::ConnectionTimeout`] if the platform did not connect in time,
    /// [`SensorError::ConnectionFailed`] if the platform connect or a subscription failed,
    /// [`SensorError::ServiceDiscoveryFailed`] if GATT enumeration failed,
    /// or [`SensorError::InvalidState`] while the device is being disconnected.
    pub async fn connect(&self, device: Device, auto_reconnect: bool) -> Result<ConnectionSnapshot> {
        ensure_permissions(
            self.inner.permissions.as_ref(),
            &[PermissionKind::BluetoothConnect],
        )
        .await?;

        let attempt = {
            let mut table = self.inner.table.lock().await;
            let entry = table
                .entry(device.id.clone())
                .or_insert_with(|| ConnectionEntry::new(device.clone()));

            match entry.state {
                ConnectionState::Connected => return Ok(entry.snapshot()),
                ConnectionState::Disconnecting => {
                    return Err(SensorError::InvalidState {
                        state: format!("{} is disconnecting", device.id),
                    })
                }
                _ => {}
            }

            if let Some(attempt) = &entry.in_flight {
                debug!("Joining connect attempt in flight for {}", device.id);
                attempt.clone()
            } else {
                if let Some(task) = entry.reconnect_task.take() {
                    debug!("Caller connect supersedes scheduled reconnect for {}", device.id);
                    task.abort();
                }
                if device.name.is_some() || !device.services.is_empty() {
                    entry.device = device;
                }
                entry.auto_reconnect = auto_reconnect;
                self.inner.begin_attempt(entry, AttemptOrigin::Caller)
            }
        };

        attempt.await
    }

    /// Disconnect a device
    ///
    /// Detaches its decoders, cancels pending reconnects, closes the platform
    /// link and publishes [`TelemetryEvent::DeviceDisconnected`]. For a device
    /// waiting to reconnect this only cancels the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::DeviceNotFound`] for an unknown device,
    /// or [`SensorError::InvalidState`] if the device is not connected.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let (handle, decoders) = {
            let mut table = self.inner.table.lock().await;
            let entry = table
                .get_mut(device_id)
                .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;

            match entry.state {
                ConnectionState::Connected => {}
                ConnectionState::Reconnecting => {
                    if let Some(task) = entry.reconnect_task.take() {
                        task.abort();
                    }
                    info!("Cancelled reconnection to {}", device_id);
                    self.inner.transition(entry, ConnectionState::Disconnected);
                    return Ok(());
                }
                state => {
                    return Err(SensorError::InvalidState {
                        state: format!("cannot disconnect {device_id} while {state}"),
                    })
                }
            }

            self.inner.transition(entry, ConnectionState::Disconnecting);
            entry.generation += 1;
            if let Some(monitor) = entry.monitor.take() {
                monitor.abort();
            }
            if let Some(task) = entry.reconnect_task.take() {
                task.abort();
            }
            (entry.handle.take(), std::mem::take(&mut entry.decoders))
        };

        info!("Disconnecting from {}", device_id);
        if let Some(handle) = handle {
            self.inner.release(&handle, decoders, true).await;
        }

        let mut table = self.inner.table.lock().await;
        if let Some(entry) = table.get_mut(device_id) {
            entry.gatt = GattSignature::default();
            self.inner.transition(entry, ConnectionState::Disconnected);
        }
        drop(table);

        self.inner.stop_collection(device_id);
        self.inner.bus.publish(TelemetryEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            unexpected: false,
        });
        Ok(())
    }

    /// Read a characteristic of a connected device
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Disconnected`] if the device is not connected,
    /// or the platform error of the read.
    pub async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        let handle = self.connected_handle(device_id).await?;
        self.inner
            .platform
            .read_characteristic(&handle, service, characteristic)
            .await
    }

    /// Write a characteristic of a connected device
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Disconnected`] if the device is not connected,
    /// or the platform error of the write.
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let handle = self.connected_handle(device_id).await?;
        debug!("Writing {:02X?} to {} on {}", data, characteristic, device_id);
        self.inner
            .platform
            .write_characteristic(&handle, service, characteristic, data, with_response)
            .await
    }

    /// Snapshot of one connection
    pub async fn snapshot(&self, device_id: &str) -> Option<ConnectionSnapshot> {
        self.inner
            .table
            .lock()
            .await
            .get(device_id)
            .map(ConnectionEntry::snapshot)
    }

    /// Snapshots of every known connection
    pub async fn connections(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .inner
            .table
            .lock()
            .await
            .values()
            .map(ConnectionEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        snapshots
    }

    /// Identifiers of the connected devices
    pub async fn active_device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .table
            .lock()
            .await
            .values()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .map(|entry| entry.device.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Disconnect every connected device and cancel pending reconnects
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .table
            .lock()
            .await
            .values()
            .filter(|entry| {
                matches!(
                    entry.state,
                    ConnectionState::Connected | ConnectionState::Reconnecting
                )
            })
            .map(|entry| entry.device.id.clone())
            .collect();

        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!("Failed to disconnect {} during shutdown: {}", id, e);
            }
        }
    }

    async fn connected_handle(&self, device_id: &str) -> Result<PeripheralHandle> {
        let table = self.inner.table.lock().await;
        table
            .get(device_id)
            .filter(|entry| entry.state == ConnectionState::Connected)
            .and_then(|entry| entry.handle.clone())
            .ok_or(SensorError::Disconnected)
    }
}

impl ManagerInner {
    fn transition(&self, entry: &mut ConnectionEntry, state: ConnectionState) {
        if entry.state == state {
            return;
        }
        debug!("{}: {} -> {}", entry.device.id, entry.state, state);
        entry.state = state;
        self.bus.publish(TelemetryEvent::ConnectionStateChanged {
            device_id: entry.device.id.clone(),
            state,
        });
    }

    fn stop_collection(&self, device_id: &str) {
        let _ = self.collection.send(CollectionEvent::Stopped {
            device_id: device_id.to_string(),
        });
    }

    /// Move an entry to `Connecting` and spawn the attempt shared by all callers
    fn begin_attempt(self: &Arc<Self>, entry: &mut ConnectionEntry, origin: AttemptOrigin) -> AttemptFuture {
        self.transition(entry, ConnectionState::Connecting);

        let inner = Arc::clone(self);
        let device_id = entry.device.id.clone();
        let task = tokio::spawn(async move { inner.run_attempt(device_id, origin).await });

        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(SensorError::Other(format!("Connect task failed: {e}"))))
        }
        .boxed()
        .shared();

        entry.in_flight = Some(attempt.clone());
        attempt
    }

    async fn run_attempt(
        self: Arc<Self>,
        device_id: String,
        origin: AttemptOrigin,
    ) -> Result<ConnectionSnapshot> {
        info!("Connecting to {}", device_id);
        match self.establish(&device_id).await {
            Ok(link) => Ok(self.finish_connected(&device_id, link).await),
            Err(error) => {
                self.finish_failed(&device_id, &error, origin).await;
                Err(error)
            }
        }
    }

    /// Platform connect, service discovery and decoder attachment
    ///
    /// Every failure path releases what was opened before returning.
    async fn establish(&self, device_id: &str) -> Result<EstablishedLink> {
        let handle = match timeout(self.config.timeout(), self.platform.connect(device_id)).await {
            Err(_) => {
                // The platform may still complete the link after the future is dropped
                let handle = PeripheralHandle::new(device_id);
                if let Err(e) = self.platform.disconnect(&handle).await {
                    debug!("Cleanup after connect timeout of {} failed: {}", device_id, e);
                }
                return Err(SensorError::ConnectionTimeout {
                    device_id: device_id.to_string(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
            Ok(Err(e)) => {
                return Err(SensorError::ConnectionFailed {
                    device_id: device_id.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(handle)) => handle,
        };

        let gatt = match self.platform.discover_services(&handle).await {
            Ok(gatt) if !gatt.is_empty() => gatt,
            Ok(_) => {
                self.release(&handle, Vec::new(), true).await;
                return Err(SensorError::ServiceDiscoveryFailed {
                    device_id: device_id.to_string(),
                    reason: "no services discovered".to_string(),
                });
            }
            Err(e) => {
                self.release(&handle, Vec::new(), true).await;
                return Err(SensorError::ServiceDiscoveryFailed {
                    device_id: device_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        debug!(
            "Discovered {} service(s) on {}",
            gatt.services.len(),
            device_id
        );

        // Readings must follow the session start marker
        let _ = self.collection.send(CollectionEvent::Started {
            device_id: device_id.to_string(),
            at: SystemTime::now(),
        });

        let mut decoders = Vec::new();
        for (service, characteristic) in gatt.characteristics() {
            let Some(kind) = self.profiles.decoder_for(characteristic) else {
                continue;
            };

            match self.platform.subscribe(&handle, service, characteristic).await {
                Ok(subscription) => {
                    debug!("Attached {} decoder on {}", kind.name(), device_id);
                    decoders.push(AttachedDecoder {
                        kind,
                        service,
                        characteristic,
                        task: self.spawn_pump(device_id, kind, subscription),
                    });
                }
                // Battery level is commonly read-only
                Err(e) if kind == FrameKind::Battery => {
                    debug!("Battery notifications unavailable on {}: {}", device_id, e);
                }
                Err(e) => {
                    self.release(&handle, decoders, true).await;
                    self.stop_collection(device_id);
                    return Err(SensorError::ConnectionFailed {
                        device_id: device_id.to_string(),
                        reason: format!("subscribing to {characteristic} failed: {e}"),
                    });
                }
            }
        }

        if decoders.iter().all(|d| d.kind == FrameKind::Battery) {
            warn!(
                "No telemetry decoder for any characteristic of {}; it will not produce readings",
                device_id
            );
        }

        if let Some(service) = gatt
            .services
            .iter()
            .find(|(_, chars)| chars.contains(&BATTERY_LEVEL_UUID))
            .map(|(service, _)| *service)
        {
            match self
                .platform
                .read_characteristic(&handle, service, BATTERY_LEVEL_UUID)
                .await
            {
                Ok(value) => forward_frame(&self.collection, device_id, FrameKind::Battery, &value),
                Err(e) => debug!("Battery read failed on {}: {}", device_id, e),
            }
        }

        Ok(EstablishedLink {
            handle,
            gatt,
            decoders,
        })
    }

    fn spawn_pump(
        &self,
        device_id: &str,
        kind: FrameKind,
        mut subscription: Subscription,
    ) -> JoinHandle<()> {
        let collection = self.collection.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = subscription.frames.recv().await {
                forward_frame(&collection, &device_id, kind, &frame);
            }
            debug!(
                "{} notifications from {} ended",
                kind.name(),
                device_id
            );
        })
    }

    async fn finish_connected(self: &Arc<Self>, device_id: &str, link: EstablishedLink) -> ConnectionSnapshot {
        let mut table = self.table.lock().await;
        let entry = table
            .entry(device_id.to_string())
            .or_insert_with(|| ConnectionEntry::new(Device::new(device_id)));

        entry.generation += 1;
        entry.in_flight = None;
        entry.reconnect_attempts = 0;
        entry.device.services.extend(link.gatt.service_ids());
        if let Some(device_type) = self.profiles.classify_services(&link.gatt.service_ids()) {
            entry.device.device_type = device_type;
        }
        entry.gatt = link.gatt;
        entry.decoders = link.decoders;
        entry.handle = Some(link.handle.clone());
        entry.monitor = Some(self.spawn_monitor(device_id, link.handle, entry.generation));
        self.transition(entry, ConnectionState::Connected);

        info!(
            "Connected to {} ({})",
            entry.device.display_name(),
            entry.device.device_type
        );
        let snapshot = entry.snapshot();
        self.bus
            .publish(TelemetryEvent::DeviceConnected(snapshot.clone()));
        snapshot
    }

    async fn finish_failed(self: &Arc<Self>, device_id: &str, error: &SensorError, origin: AttemptOrigin) {
        warn!("Connect attempt to {} failed: {}", device_id, error);

        let mut table = self.table.lock().await;
        let Some(entry) = table.get_mut(device_id) else {
            return;
        };
        entry.in_flight = None;
        self.bus.publish(TelemetryEvent::ConnectionError {
            device_id: device_id.to_string(),
            error: error.clone(),
        });

        if origin == AttemptOrigin::Reconnect && entry.auto_reconnect {
            self.schedule_reconnect(entry);
        } else {
            self.transition(entry, ConnectionState::Disconnected);
        }
    }

    fn spawn_monitor(self: &Arc<Self>, device_id: &str, handle: PeripheralHandle, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = inner.platform.wait_for_disconnect(&handle).await {
                warn!("Lost track of link state for {}: {}", device_id, e);
            }
            inner.handle_unexpected_drop(&device_id, generation).await;
        })
    }

    async fn handle_unexpected_drop(self: &Arc<Self>, device_id: &str, generation: u64) {
        let (handle, decoders, teardown) = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(device_id) else {
                return;
            };
            if entry.generation != generation || entry.state != ConnectionState::Connected {
                return;
            }

            warn!("{} dropped the connection", entry.device.display_name());
            entry.generation += 1;
            // This task is the monitor; detach rather than abort it
            entry.monitor = None;
            entry.gatt = GattSignature::default();
            self.transition(entry, ConnectionState::Disconnecting);

            self.stop_collection(device_id);
            self.bus.publish(TelemetryEvent::DeviceDisconnected {
                device_id: device_id.to_string(),
                unexpected: true,
            });
            (
                entry.handle.take(),
                std::mem::take(&mut entry.decoders),
                entry.generation,
            )
        };

        match handle {
            Some(handle) => self.release(&handle, decoders, false).await,
            None => decoders.into_iter().for_each(|decoder| decoder.task.abort()),
        }

        let mut table = self.table.lock().await;
        let Some(entry) = table.get_mut(device_id) else {
            return;
        };
        if entry.generation != teardown || entry.state != ConnectionState::Disconnecting {
            return;
        }
        if entry.auto_reconnect {
            self.schedule_reconnect(entry);
        } else {
            self.transition(entry, ConnectionState::Disconnected);
        }
    }

    /// Wait the fixed backoff, then reconnect; give up once attempts are exhausted
    fn schedule_reconnect(self: &Arc<Self>, entry: &mut ConnectionEntry) {
        let max_attempts = self.config.max_reconnect_attempts;
        if entry.reconnect_attempts >= max_attempts {
            error!(
                "Giving up on {} after {} reconnect attempts",
                entry.device.id, entry.reconnect_attempts
            );
            self.transition(entry, ConnectionState::Disconnected);
            self.bus.publish(TelemetryEvent::ConnectionError {
                device_id: entry.device.id.clone(),
                error: SensorError::MaxReconnectAttemptsExceeded {
                    device_id: entry.device.id.clone(),
                    attempts: entry.reconnect_attempts,
                },
            });
            return;
        }

        self.transition(entry, ConnectionState::Reconnecting);
        let inner = Arc::clone(self);
        let device_id = entry.device.id.clone();
        let delay = self.config.reconnect_delay();
        entry.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(&device_id).await;
        }));
    }

    async fn reconnect(self: &Arc<Self>, device_id: &str) {
        let attempt = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(device_id) else {
                return;
            };
            if entry.state != ConnectionState::Reconnecting || entry.in_flight.is_some() {
                return;
            }

            // This task is the schedule; detach rather than abort it
            entry.reconnect_task = None;
            entry.reconnect_attempts += 1;
            info!(
                "Reconnecting to {} (attempt {}/{})",
                device_id, entry.reconnect_attempts, self.config.max_reconnect_attempts
            );
            self.begin_attempt(entry, AttemptOrigin::Reconnect)
        };

        // The outcome is handled by the attempt itself
        let _ = attempt.await;
    }

    /// Detach decoders and close the link, logging failures
    ///
    /// On a link that already dropped, failures are expected and logged quietly.
    async fn release(
        &self,
        handle: &PeripheralHandle,
        decoders: Vec<AttachedDecoder>,
        link_alive: bool,
    ) {
        for decoder in decoders {
            if let Err(e) = self
                .platform
                .unsubscribe(handle, decoder.service, decoder.characteristic)
                .await
            {
                debug!(
                    "Unsubscribe from {} on {} failed: {}",
                    decoder.characteristic, handle.device_id, e
                );
            }
            decoder.task.abort();
        }

        match self.platform.disconnect(handle).await {
            Err(e) if link_alive => {
                warn!("Platform disconnect of {} failed: {}", handle.device_id, e);
            }
            Err(e) => debug!("Releasing dropped link of {}: {}", handle.device_id, e),
            Ok(()) => {}
        }
    }
}

/// Decode one frame and forward its readings; malformed frames are dropped
fn forward_frame(
    collection: &mpsc::UnboundedSender<CollectionEvent>,
    device_id: &str,
    kind: FrameKind,
    data: &[u8],
) {
    match kind.decode(data) {
        Ok(frame) => {
            for reading in frame.into_readings(device_id, SystemTime::now()) {
                let _ = collection.send(CollectionEvent::Reading(reading));
            }
        }
        Err(e) => warn!("Dropping frame from {}: {}", device_id, e),
    }
}
