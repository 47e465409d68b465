//! `bluest`-backed [`Transport`] implementation.
//!
//! Talks to the platform Bluetooth stack: finds the power station by its
//! advertised name, connects, resolves the Bluetti GATT service and pumps
//! notify events into the subscriber callback from a background task.

use crate::transport::{Advertisement, NotificationCallback, Transport, SERVICE_UUID};
use crate::Error;
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

// How long to scan for the target device before giving up on a connect.
const FIND_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

fn ble_err(err: bluest::Error) -> Error {
    Error::Connection(err.to_string())
}

fn parse_uuid(uuid: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(uuid).map_err(|err| Error::Connection(format!("invalid UUID {uuid}: {err}")))
}

#[derive(Default)]
struct BleState {
    device: Option<Device>,
    characteristics: HashMap<String, Characteristic>,
    notify_task: Option<tokio::task::JoinHandle<()>>,
}

/// BLE transport bound to one device name.
pub struct BluestTransport {
    adapter: Adapter,
    target_name: String,
    state: Mutex<BleState>,
}

impl BluestTransport {
    /// Acquire the default adapter and bind to the device advertising
    /// `target_name`.
    pub async fn new(target_name: &str) -> Result<Self, Error> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::Connection("default adapter not found".into()))?;
        adapter.wait_available().await.map_err(ble_err)?;
        Ok(Self {
            adapter,
            target_name: target_name.to_string(),
            state: Mutex::new(BleState::default()),
        })
    }

    async fn find_device(&self) -> Result<Device, Error> {
        let services = [parse_uuid(SERVICE_UUID)?];
        let mut scan = self.adapter.scan(&services).await.map_err(ble_err)?;
        let found = tokio::time::timeout(FIND_DEVICE_TIMEOUT, async {
            while let Some(discovered) = scan.next().await {
                match discovered.device.name_async().await {
                    Ok(name) if name == self.target_name => return Some(discovered.device),
                    _ => {}
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(device)) => Ok(device),
            _ => Err(Error::Connection(format!(
                "device '{}' not found",
                self.target_name
            ))),
        }
    }

    fn characteristic(&self, uuid: &str) -> Result<Characteristic, Error> {
        self.state
            .lock()
            .characteristics
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("characteristic {uuid} not resolved")))
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, Error> {
        let mut scan = self.adapter.scan(&[]).await.map_err(ble_err)?;
        let mut found = Vec::new();
        let _ = tokio::time::timeout(timeout, async {
            while let Some(discovered) = scan.next().await {
                let name = match discovered.adv_data.local_name.clone() {
                    Some(name) => Some(name),
                    None => discovered.device.name_async().await.ok(),
                };
                let mut manufacturer_data = HashMap::new();
                if let Some(data) = discovered.adv_data.manufacturer_data {
                    manufacturer_data.insert(data.company_id, data.data);
                }
                found.push(Advertisement {
                    name,
                    manufacturer_data,
                });
            }
        })
        .await;
        Ok(found)
    }

    async fn connect(&self) -> Result<(), Error> {
        let existing = self.state.lock().device.clone();
        if let Some(device) = existing {
            if device.is_connected().await {
                return Ok(());
            }
            self.adapter.connect_device(&device).await.map_err(ble_err)?;
            return Ok(());
        }

        let device = self.find_device().await?;
        self.adapter.connect_device(&device).await.map_err(ble_err)?;

        let service = device
            .discover_services_with_uuid(parse_uuid(SERVICE_UUID)?)
            .await
            .map_err(ble_err)?
            .first()
            .cloned()
            .ok_or_else(|| Error::Connection("device does not expose the Bluetti service".into()))?;
        let characteristics = service.discover_characteristics().await.map_err(ble_err)?;

        let mut state = self.state.lock();
        state.characteristics = characteristics
            .into_iter()
            .map(|c| (c.uuid().to_string(), c))
            .collect();
        state.device = Some(device);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let (device, task) = {
            let mut state = self.state.lock();
            (state.device.take(), state.notify_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(device) = device {
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(ble_err)?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let device = self.state.lock().device.clone();
        match device {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }

    async fn write(&self, characteristic: &str, data: &[u8]) -> Result<(), Error> {
        let characteristic = self.characteristic(characteristic)?;
        characteristic.write(data).await.map_err(ble_err)
    }

    async fn subscribe(
        &self,
        characteristic: &str,
        callback: NotificationCallback,
    ) -> Result<(), Error> {
        let characteristic = self.characteristic(characteristic)?;
        let task = tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    log::warn!("Notify subscription failed: {err}");
                    return;
                }
            };
            while let Some(event) = notifications.next().await {
                match event {
                    Ok(data) => callback(data),
                    Err(err) => {
                        log::warn!("Notification error: {err}");
                        break;
                    }
                }
            }
        });
        let old = self.state.lock().notify_task.replace(task);
        if let Some(old) = old {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: &str) -> Result<(), Error> {
        if let Some(task) = self.state.lock().notify_task.take() {
            task.abort();
        }
        Ok(())
    }
}
