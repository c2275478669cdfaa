use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{Advertisement, GattSignature, PermissionKind, ScanFilterConfig},
};

/// Opaque handle to an open platform link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    /// Device identifier the link belongs to
    pub device_id: String,
}

impl PeripheralHandle {
    /// Create a handle for a device
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

/// Notification stream of one subscribed characteristic
#[derive(Debug)]
pub struct Subscription {
    /// Service the characteristic lives in
    pub service: Uuid,
    /// Subscribed characteristic
    pub characteristic: Uuid,
    /// Raw frames in arrival order; closes when the platform stops delivering
    pub frames: mpsc::UnboundedReceiver<Bytes>,
}

/// Primitive operations of the BLE radio stack
///
/// All methods suspend on platform I/O and complete with a typed result.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Start advertisement delivery
    ///
    /// The returned channel yields one [`Advertisement`] per report until
    /// [`BlePlatform::stop_scan`] is called.
    async fn start_scan(
        &self,
        filter: &ScanFilterConfig,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>>;

    /// Stop advertisement delivery
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a device
    async fn connect(&self, device_id: &str) -> Result<PeripheralHandle>;

    /// Enumerate services and characteristics of a connected device
    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<GattSignature>;

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Bytes>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications for a characteristic
    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Subscription>;

    /// Disable notifications for a characteristic
    async fn unsubscribe(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;

    /// Resolve when the link drops without being asked to
    async fn wait_for_disconnect(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Close a link
    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()>;
}

/// Runtime permission queries
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Check whether a permission is held
    async fn has_permission(&self, kind: PermissionKind) -> bool;

    /// Ask the user for a permission, returning whether it was granted
    async fn request_permission(&self, kind: PermissionKind) -> bool;
}

/// Permission service for platforms without runtime Bluetooth permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedPermissions;

#[async_trait]
impl PermissionService for GrantedPermissions {
    async fn has_permission(&self, _kind: PermissionKind) -> bool {
        true
    }

    async fn request_permission(&self, _kind: PermissionKind) -> bool {
        true
    }
}

/// Check every permission, requesting the missing ones
///
/// # Errors
///
/// Returns [`crate::SensorError::PermissionDenied`] for the first permission refused.
pub async fn ensure_permissions(
    permissions: &dyn PermissionService,
    kinds: &[PermissionKind],
) -> Result<()> {
    for &kind in kinds {
        if permissions.has_permission(kind).await {
            continue;
        }

        tracing::debug!("Requesting {} permission", kind);
        if !permissions.request_permission(kind).await {
            tracing::warn!("{} permission refused", kind);
            return Err(crate::SensorError::PermissionDenied { permission: kind });
        }
    }

    Ok(())
}
