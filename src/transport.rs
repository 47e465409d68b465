use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// GATT service exposed by Bluetti power stations.
pub const SERVICE_UUID: &str = "0000ff00-0000-1000-8000-00805f9b34fb";
/// Characteristic command frames are written to.
pub const WRITE_UUID: &str = "0000ff02-0000-1000-8000-00805f9b34fb";
/// Characteristic delivering response notifications.
pub const NOTIFY_UUID: &str = "0000ff01-0000-1000-8000-00805f9b34fb";

/// Manufacturer data payload advertising encryption support.
pub const ENCRYPTION_MARKER: &[u8] = b"BLUETTF";

/// Callback invoked for every notification payload.
pub type NotificationCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// One device seen during a discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Whether any manufacturer data entry carries the encryption marker.
    pub fn has_encryption_marker(&self) -> bool {
        self.manufacturer_data
            .values()
            .any(|value| value == ENCRYPTION_MARKER)
    }
}

/// Platform BLE transport consumed by the device reader.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Collect advertisements from nearby devices for up to `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, Error>;

    async fn connect(&self) -> Result<(), Error>;

    async fn disconnect(&self) -> Result<(), Error>;

    async fn is_connected(&self) -> bool;

    /// Fire-and-forget write to a characteristic.
    async fn write(&self, characteristic: &str, data: &[u8]) -> Result<(), Error>;

    /// Route notifications from a characteristic into `callback`.
    async fn subscribe(
        &self,
        characteristic: &str,
        callback: NotificationCallback,
    ) -> Result<(), Error>;

    async fn unsubscribe(&self, characteristic: &str) -> Result<(), Error>;
}
