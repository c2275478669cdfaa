use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SensorError},
    platform::{BlePlatform, PeripheralHandle, Subscription},
    types::{Advertisement, GattSignature, ScanFilterConfig},
};

/// [`BlePlatform`] backed by the first local Bluetooth adapter
///
/// Devices are identified by their Bluetooth address string.
pub struct BtleplugPlatform {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    notification_tasks: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
}

impl BtleplugPlatform {
    /// Open the first available adapter
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`SensorError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SensorError::DeviceNotFound("Bluetooth adapter".to_string()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter
    #[must_use]
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
            notification_tasks: Mutex::new(HashMap::new()),
        }
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        // Not seen by a scan in this session; ask the adapter cache
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == device_id)
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))?;

        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(&handle.device_id).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                SensorError::Other(format!(
                    "characteristic {characteristic} not found on {}",
                    handle.device_id
                ))
            })?;
        Ok((peripheral, found))
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn start_scan(
        &self,
        filter: &ScanFilterConfig,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(scan_filter(filter)).await?;
        debug!("Adapter scan started");

        let (sender, receiver) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };

                let Some(advertisement) = advertisement(&adapter, &peripherals, &id).await else {
                    continue;
                };
                if sender.send(advertisement).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(receiver)
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        debug!("Adapter scan stopped");
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<PeripheralHandle> {
        let peripheral = self.peripheral(device_id).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        Ok(PeripheralHandle::new(device_id))
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<GattSignature> {
        let peripheral = self.peripheral(&handle.device_id).await?;
        peripheral.discover_services().await?;

        if !peripheral.is_connected().await? {
            return Err(SensorError::Disconnected);
        }

        let mut gatt = GattSignature::default();
        for service in peripheral.services() {
            gatt.insert_service(service.uuid);
            for characteristic in &service.characteristics {
                gatt.insert(service.uuid, characteristic.uuid);
            }
        }
        Ok(gatt)
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes> {
        let (peripheral, characteristic) =
            self.characteristic(handle, service, characteristic).await?;
        Ok(Bytes::from(peripheral.read(&characteristic).await?))
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) =
            self.characteristic(handle, service, characteristic).await?;
        peripheral
            .write(&characteristic, data, write_type(with_response))
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription> {
        let (peripheral, found) = self.characteristic(handle, service, characteristic).await?;
        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&found).await?;

        let (sender, frames) = mpsc::unbounded_channel();
        let device_id = handle.device_id.clone();
        let task = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid != characteristic {
                    continue;
                }
                if sender.send(Bytes::from(data.value)).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} on {} closed", characteristic, device_id);
        });

        if let Some(previous) = self
            .notification_tasks
            .lock()
            .await
            .insert((handle.device_id.clone(), characteristic), task)
        {
            previous.abort();
        }

        Ok(Subscription {
            service,
            characteristic,
            frames,
        })
    }

    async fn unsubscribe(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        if let Some(task) = self
            .notification_tasks
            .lock()
            .await
            .remove(&(handle.device_id.clone(), characteristic))
        {
            task.abort();
        }

        let (peripheral, found) = self.characteristic(handle, service, characteristic).await?;
        peripheral.unsubscribe(&found).await?;
        Ok(())
    }

    async fn wait_for_disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.peripheral(&handle.device_id).await?;
        let peripheral_id: PeripheralId = peripheral.id();
        let mut events = self.adapter.events().await?;

        // The link may have gone while the stream was being opened
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == peripheral_id {
                    info!("{} disconnected", handle.device_id);
                    return Ok(());
                }
            }
        }

        Err(SensorError::Ble("adapter event stream ended".to_string()))
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.notification_tasks
            .lock()
            .await
            .retain(|(device_id, _), task| {
                if *device_id == handle.device_id {
                    task.abort();
                    false
                } else {
                    true
                }
            });

        let peripheral = self.peripheral(&handle.device_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }
}

/// Resolve an adapter event into an advertisement, caching the peripheral
async fn advertisement(
    adapter: &Adapter,
    peripherals: &Mutex<HashMap<String, Peripheral>>,
    id: &PeripheralId,
) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            warn!("Advertised peripheral vanished: {}", e);
            return None;
        }
    };
    let properties = peripheral.properties().await.ok().flatten()?;
    let device_id = properties.address.to_string();

    peripherals
        .lock()
        .await
        .insert(device_id.clone(), peripheral);

    Some(Advertisement {
        device_id,
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or(i16::MIN),
        services: properties.services,
    })
}

/// Platform-side filter; name and signal filtering happen in the scanner
fn scan_filter(filter: &ScanFilterConfig) -> ScanFilter {
    ScanFilter {
        services: filter.service_ids.clone(),
    }
}

const fn write_type(with_response: bool) -> WriteType {
    if with_response {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}
