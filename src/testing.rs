use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    error::{Result, SensorError},
    platform::{BlePlatform, PeripheralHandle, PermissionService, Subscription},
    profiles::{
        BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
        HEART_RATE_SERVICE_UUID, RUNNING_DYNAMICS_MEASUREMENT_UUID, RUNNING_DYNAMICS_SERVICE_UUID,
        RUNNING_POWER_MEASUREMENT_UUID, RUNNING_POWER_SERVICE_UUID,
    },
    types::{Advertisement, GattSignature, PermissionKind, ScanFilterConfig},
};

/// Outcome scripted for the next platform connect
#[derive(Debug, Clone)]
pub enum ConnectScript {
    /// Succeed after a delay
    Succeed(Duration),
    /// Fail with an error
    Fail(String),
    /// Never complete
    Hang,
}

#[derive(Default)]
struct MockState {
    scan_sender: Option<mpsc::UnboundedSender<Advertisement>>,
    scans_started: usize,
    scans_stopped: usize,
    connect_scripts: HashMap<String, VecDeque<ConnectScript>>,
    gatt: HashMap<String, GattSignature>,
    discovery_failures: HashMap<String, String>,
    frame_senders: HashMap<(String, Uuid), mpsc::UnboundedSender<Bytes>>,
    reads: HashMap<(String, Uuid), Bytes>,
    writes: Vec<(String, Uuid, Vec<u8>, bool)>,
    unsubscribed: Vec<(String, Uuid)>,
    link_drops: HashMap<String, oneshot::Sender<()>>,
    link_watchers: HashMap<String, oneshot::Receiver<()>>,
    disconnects: Vec<String>,
}

/// In-memory platform driven by the test body
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
    connect_calls: AtomicUsize,
}

pub fn heart_rate_gatt() -> GattSignature {
    let mut gatt = GattSignature::default();
    gatt.insert(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID);
    gatt.insert(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
    gatt
}

pub fn foot_pod_gatt() -> GattSignature {
    let mut gatt = GattSignature::default();
    gatt.insert(RUNNING_DYNAMICS_SERVICE_UUID, RUNNING_DYNAMICS_MEASUREMENT_UUID);
    gatt.insert(RUNNING_POWER_SERVICE_UUID, RUNNING_POWER_MEASUREMENT_UUID);
    gatt
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_gatt(&self, device_id: &str, gatt: GattSignature) {
        self.state().gatt.insert(device_id.to_string(), gatt);
    }

    pub fn fail_discovery(&self, device_id: &str, reason: &str) {
        self.state()
            .discovery_failures
            .insert(device_id.to_string(), reason.to_string());
    }

    pub fn script_connect(&self, device_id: &str, script: ConnectScript) {
        self.state()
            .connect_scripts
            .entry(device_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn set_read_value(&self, device_id: &str, characteristic: Uuid, value: &[u8]) {
        self.state().reads.insert(
            (device_id.to_string(), characteristic),
            Bytes::copy_from_slice(value),
        );
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn scans_started(&self) -> usize {
        self.state().scans_started
    }

    pub fn scans_stopped(&self) -> usize {
        self.state().scans_stopped
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.state().disconnects.clone()
    }

    pub fn unsubscribed(&self) -> Vec<(String, Uuid)> {
        self.state().unsubscribed.clone()
    }

    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>, bool)> {
        self.state().writes.clone()
    }

    /// Deliver an advertisement to the running scan; false when no scan runs
    pub fn advertise(&self, device_id: &str, name: Option<&str>, rssi: i16, services: &[Uuid]) -> bool {
        let state = self.state();
        let Some(sender) = state.scan_sender.as_ref() else {
            return false;
        };
        sender
            .send(Advertisement {
                device_id: device_id.to_string(),
                name: name.map(str::to_string),
                rssi,
                services: services.to_vec(),
            })
            .is_ok()
    }

    /// Deliver a notification frame; false when nothing is subscribed
    pub fn push_frame(&self, device_id: &str, characteristic: Uuid, frame: &[u8]) -> bool {
        let state = self.state();
        state
            .frame_senders
            .get(&(device_id.to_string(), characteristic))
            .is_some_and(|sender| sender.send(Bytes::copy_from_slice(frame)).is_ok())
    }

    /// Drop the link as if the device walked out of range
    pub fn drop_link(&self, device_id: &str) {
        let mut state = self.state();
        state.frame_senders.retain(|(id, _), _| id != device_id);
        if let Some(sender) = state.link_drops.remove(device_id) {
            let _ = sender.send(());
        }
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn start_scan(
        &self,
        _filter: &ScanFilterConfig,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.scan_sender = Some(sender);
        state.scans_started += 1;
        Ok(receiver)
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state();
        state.scan_sender = None;
        state.scans_stopped += 1;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<PeripheralHandle> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .state()
            .connect_scripts
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ConnectScript::Succeed(Duration::from_millis(10)));

        match script {
            ConnectScript::Succeed(delay) => tokio::time::sleep(delay).await,
            ConnectScript::Fail(reason) => return Err(SensorError::Ble(reason)),
            ConnectScript::Hang => futures::future::pending::<()>().await,
        }

        let (drop_tx, drop_rx) = oneshot::channel();
        let mut state = self.state();
        state.link_drops.insert(device_id.to_string(), drop_tx);
        state.link_watchers.insert(device_id.to_string(), drop_rx);
        Ok(PeripheralHandle::new(device_id))
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<GattSignature> {
        let state = self.state();
        if let Some(reason) = state.discovery_failures.get(&handle.device_id) {
            return Err(SensorError::Ble(reason.clone()));
        }
        Ok(state.gatt.get(&handle.device_id).cloned().unwrap_or_default())
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        self.state()
            .reads
            .get(&(handle.device_id.clone(), characteristic))
            .cloned()
            .ok_or_else(|| SensorError::Other("characteristic not readable".to_string()))
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.state().writes.push((
            handle.device_id.clone(),
            characteristic,
            data.to_vec(),
            with_response,
        ));
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription> {
        let (sender, frames) = mpsc::unbounded_channel();
        self.state()
            .frame_senders
            .insert((handle.device_id.clone(), characteristic), sender);
        Ok(Subscription {
            service,
            characteristic,
            frames,
        })
    }

    async fn unsubscribe(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let mut state = self.state();
        state
            .frame_senders
            .remove(&(handle.device_id.clone(), characteristic));
        state
            .unsubscribed
            .push((handle.device_id.clone(), characteristic));
        Ok(())
    }

    async fn wait_for_disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let watcher = self.state().link_watchers.remove(&handle.device_id);
        match watcher {
            Some(receiver) => {
                if receiver.await.is_err() {
                    // Sender dropped by a requested disconnect, not a link loss
                    futures::future::pending::<()>().await;
                }
                Ok(())
            }
            None => futures::future::pending().await,
        }
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let mut state = self.state();
        state.link_drops.remove(&handle.device_id);
        state.link_watchers.remove(&handle.device_id);
        state.frame_senders.retain(|(id, _), _| *id != handle.device_id);
        state.disconnects.push(handle.device_id.clone());
        Ok(())
    }
}

/// Permission service refusing one permission
pub struct DeniedPermissions {
    denied: PermissionKind,
    requests: AtomicUsize,
}

impl DeniedPermissions {
    pub fn new(denied: PermissionKind) -> Self {
        Self {
            denied,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionService for DeniedPermissions {
    async fn has_permission(&self, kind: PermissionKind) -> bool {
        kind != self.denied
    }

    async fn request_permission(&self, kind: PermissionKind) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        kind != self.denied
    }
}
