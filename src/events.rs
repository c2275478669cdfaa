use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    error::SensorError,
    metrics::SessionMetrics,
    types::{ConnectionSnapshot, ConnectionState, Device, SensorReading},
};

/// Event published to telemetry consumers
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A scan window opened
    ScanStarted {
        /// Scan window in milliseconds
        duration_ms: u64,
    },
    /// An admitted device was seen
    DeviceDiscovered(Device),
    /// The scan window closed, carrying every device seen during it
    ScanStopped {
        /// Devices merged during the scan
        devices: Vec<Device>,
    },
    /// A connection moved to a new state
    ConnectionStateChanged {
        /// Device identifier
        device_id: String,
        /// New state
        state: ConnectionState,
    },
    /// A connection became usable
    DeviceConnected(ConnectionSnapshot),
    /// A connection went away
    DeviceDisconnected {
        /// Device identifier
        device_id: String,
        /// True when the platform dropped the link on its own
        unexpected: bool,
    },
    /// A connect attempt failed or automatic reconnection gave up
    ConnectionError {
        /// Device identifier
        device_id: String,
        /// What went wrong
        error: SensorError,
    },
    /// A decoded value arrived
    Reading(SensorReading),
    /// Derived metrics changed after a reading
    MetricsUpdated(SessionMetrics),
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per receiver
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: TelemetryEvent) {
        if self.sender.send(event).is_err() {
            trace!("Telemetry event dropped: no subscribers");
        }
    }

    /// Register a new consumer
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Number of live consumers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
