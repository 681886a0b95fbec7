//! [`Radio`] backed by the platform Bluetooth stack through `bluest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BleLink, Peripheral, Radio};
use crate::error::{TransportError, WriteError};

// Notifications buffered between the stack and the session.
const NOTIFICATION_QUEUE: usize = 64;

struct Seen {
    device: Device,
    name: Option<String>,
}

pub struct BluestRadio {
    adapter: Adapter,
    registry: Arc<Mutex<HashMap<String, Seen>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl BluestRadio {
    /// Open the default Bluetooth adapter and wait for it to power up.
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        Ok(Self {
            adapter,
            registry: Arc::default(),
            scanner: Mutex::new(None),
        })
    }

    fn device(&self, peripheral: &Peripheral) -> Result<Device, TransportError> {
        self.registry
            .lock()
            .map_err(|_| TransportError::new("peripheral registry poisoned"))?
            .get(&peripheral.id)
            .map(|seen| seen.device.clone())
            .ok_or_else(|| TransportError::new(format!("{} is no longer known", peripheral.id)))
    }

    fn abort_scanner(&self) {
        if let Ok(mut scanner) = self.scanner.lock() {
            if let Some(handle) = scanner.take() {
                handle.abort();
            }
        }
    }
}

fn device_id(device: &Device) -> String {
    format!("{:?}", device.id())
}

#[async_trait]
impl Radio for BluestRadio {
    async fn start_discovery(&self) -> Result<(), TransportError> {
        self.abort_scanner();
        if let Ok(mut registry) = self.registry.lock() {
            registry.clear();
        }

        let adapter = self.adapter.clone();
        let registry = Arc::clone(&self.registry);
        let (started_tx, started_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.scan(&[]).await {
                Ok(events) => {
                    let _ = started_tx.send(Ok(()));
                    events
                }
                Err(err) => {
                    let _ = started_tx.send(Err(err.to_string()));
                    return;
                }
            };

            while let Some(found) = events.next().await {
                let name = match found.adv_data.local_name {
                    Some(name) => Some(name),
                    None => found.device.name_async().await.ok(),
                };
                let id = device_id(&found.device);
                debug!(%id, ?name, "advertisement");
                if let Ok(mut registry) = registry.lock() {
                    registry.insert(
                        id,
                        Seen {
                            device: found.device,
                            name,
                        },
                    );
                }
            }
        });

        match started_rx.await {
            Ok(Ok(())) => {
                if let Ok(mut scanner) = self.scanner.lock() {
                    *scanner = Some(handle);
                }
                Ok(())
            }
            Ok(Err(msg)) => Err(TransportError::new(format!("scan failed: {msg}"))),
            Err(_) => Err(TransportError::new("scan task ended unexpectedly")),
        }
    }

    async fn stop_discovery(&self) {
        self.abort_scanner();
    }

    async fn peripherals(&self) -> Result<Vec<Peripheral>, TransportError> {
        let registry = self
            .registry
            .lock()
            .map_err(|_| TransportError::new("peripheral registry poisoned"))?;
        Ok(registry
            .iter()
            .map(|(id, seen)| Peripheral {
                id: id.clone(),
                name: seen.name.clone(),
            })
            .collect())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<Box<dyn BleLink>, TransportError> {
        let device = self.device(peripheral)?;
        self.adapter
            .connect_device(&device)
            .await
            .map_err(|err| TransportError::new(err.to_string()))?;

        Ok(Box::new(BluestLink {
            adapter: self.adapter.clone(),
            device,
            characteristics: HashMap::new(),
            notifier: None,
        }))
    }

    async fn disconnect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        if !device.is_connected().await {
            return Ok(());
        }
        self.adapter
            .disconnect_device(&device)
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }
}

struct BluestLink {
    adapter: Adapter,
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    notifier: Option<JoinHandle<()>>,
}

impl BluestLink {
    fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics.get(&uuid).cloned()
    }
}

/// BlueZ answers a write issued while another is still pending with
/// `org.bluez.Error.InProgress`.
fn is_busy(err: &bluest::Error) -> bool {
    let msg = err.to_string();
    msg.contains("In Progress") || msg.contains("InProgress")
}

#[async_trait]
impl BleLink for BluestLink {
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, TransportError> {
        let services = self
            .device
            .discover_services()
            .await
            .map_err(|err| TransportError::new(err.to_string()))?;

        for service in services {
            let characteristics = service
                .discover_characteristics()
                .await
                .map_err(|err| TransportError::new(err.to_string()))?;
            for characteristic in characteristics {
                self.characteristics.insert(characteristic.uuid(), characteristic);
            }
        }

        Ok(self.characteristics.keys().copied().collect())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let characteristic = self
            .characteristic(uuid)
            .ok_or_else(|| TransportError::new(format!("characteristic {uuid} not discovered")))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut reader = match characteristic.notify().await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
            };

            while let Some(item) = reader.next().await {
                match item {
                    Ok(data) => {
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "notification error");
                        break;
                    }
                }
            }
            debug!("end of notification stream");
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                self.notifier = Some(handle);
                Ok(rx)
            }
            Ok(Err(msg)) => Err(TransportError::new(msg)),
            Err(_) => Err(TransportError::new("notification task ended unexpectedly")),
        }
    }

    async fn write(&mut self, uuid: Uuid, payload: &[u8]) -> Result<(), WriteError> {
        let characteristic = self
            .characteristic(uuid)
            .ok_or_else(|| WriteError::Failed(format!("characteristic {uuid} not discovered")))?;

        characteristic.write(payload).await.map_err(|err| {
            if is_busy(&err) {
                WriteError::Busy
            } else {
                WriteError::Failed(err.to_string())
            }
        })
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(handle) = self.notifier.take() {
            handle.abort();
        }
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }
}

impl Drop for BluestLink {
    fn drop(&mut self) {
        if let Some(handle) = self.notifier.take() {
            handle.abort();
        }
    }
}
