//! GATT Session Module
//!
//! btleplug plumbing shared by both adapters: opening the host central,
//! describing discovered peripherals, and the per-connection session that owns
//! characteristic lookup, notification dispatch and writes.

use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::protocol::{Channel, SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{
    NotificationHandler, TransportError, WriteReliability,
};
use btleplug::api::{Central as _, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Lazily opened host BLE central (first adapter reported by the OS).
#[derive(Default)]
pub(crate) struct HostCentral {
    cell: OnceCell<(Manager, Adapter)>,
}

impl HostCentral {
    pub(crate) async fn adapter(&self) -> Result<&Adapter, TransportError> {
        let (_, adapter) = self
            .cell
            .get_or_try_init(|| async {
                let manager = Manager::new()
                    .await
                    .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
                let adapter = manager
                    .adapters()
                    .await
                    .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        TransportError::AdapterUnavailable("No BLE adapter found".to_string())
                    })?;
                match adapter.adapter_info().await {
                    Ok(info) => info!("Using BLE adapter: {}", info),
                    Err(e) => debug!("Could not read adapter info: {}", e),
                }
                Ok::<_, TransportError>((manager, adapter))
            })
            .await?;
        Ok(adapter)
    }

    pub(crate) async fn is_available(&self) -> bool {
        match self.adapter().await {
            Ok(_) => true,
            Err(e) => {
                warn!("BLE capability probe failed: {}", e);
                false
            }
        }
    }
}

/// What a peripheral last advertised
pub(crate) struct Advertisement {
    pub(crate) device: DeviceHandle,
    pub(crate) services: Vec<Uuid>,
}

/// Read the cached advertisement of a peripheral
pub(crate) async fn describe(peripheral: &Peripheral) -> Advertisement {
    let id = peripheral.id().to_string();
    match peripheral.properties().await {
        Ok(Some(props)) => Advertisement {
            device: DeviceHandle::new(id, props.local_name, props.rssi),
            services: props.services,
        },
        Ok(None) => Advertisement {
            device: DeviceHandle::new(id, None, None),
            services: Vec::new(),
        },
        Err(e) => {
            trace!("No properties for {}: {}", id, e);
            Advertisement {
                device: DeviceHandle::new(id, None, None),
                services: Vec::new(),
            }
        }
    }
}

/// An empty `wanted` list accepts every advertisement.
pub(crate) fn advertises_any(services: &[Uuid], wanted: &[Uuid]) -> bool {
    wanted.is_empty() || wanted.iter().any(|uuid| services.contains(uuid))
}

/// Drop a half-open connection after a failed setup step.
async fn abandon(peripheral: &Peripheral) {
    if let Err(e) = peripheral.disconnect().await {
        debug!("Failed to drop half-open connection: {}", e);
    }
}

type HandlerMap = Arc<Mutex<HashMap<Channel, NotificationHandler>>>;

/// A live GATT connection to the RoboCar service
pub(crate) struct GattSession {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    handlers: HandlerMap,
    dispatcher: JoinHandle<()>,
}

impl GattSession {
    /// Connect (bounded by `connect_timeout`), discover services and start
    /// routing notifications to subscribed handlers.
    pub(crate) async fn open(
        peripheral: Peripheral,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let connected = peripheral
            .is_connected()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if !connected {
            match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransportError::Connection(e.to_string())),
                Err(_) => {
                    // the stack may still complete the link after we gave up
                    abandon(&peripheral).await;
                    return Err(TransportError::Connection("timeout".to_string()));
                }
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            abandon(&peripheral).await;
            return Err(TransportError::Connection(e.to_string()));
        }

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == SERVICE_UUID)
            .map(|c| (c.uuid, c))
            .collect();
        if characteristics.is_empty() {
            abandon(&peripheral).await;
            return Err(TransportError::Connection(
                "RoboCar service not found".to_string(),
            ));
        }
        info!("Found {} service characteristics", characteristics.len());

        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                abandon(&peripheral).await;
                return Err(TransportError::Connection(e.to_string()));
            }
        };

        let handlers: HandlerMap = Arc::default();
        let routes = handlers.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handler = Channel::from_characteristic(notification.uuid).and_then(|channel| {
                    routes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&channel)
                        .cloned()
                });
                match handler {
                    Some(handler) => handler(notification.value).await,
                    None => trace!("Unrouted notification from {}", notification.uuid),
                }
            }
            debug!("Notification stream closed");
        });

        Ok(Self {
            peripheral,
            characteristics,
            handlers,
            dispatcher,
        })
    }

    fn characteristic(&self, channel: Channel) -> Option<&Characteristic> {
        self.characteristics.get(&channel.characteristic_uuid())
    }

    pub(crate) async fn subscribe(
        &self,
        channel: Channel,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel).ok_or_else(|| {
            TransportError::Subscription(format!("{} characteristic not found", channel))
        })?;

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, handler);

        if let Err(e) = self.peripheral.subscribe(characteristic).await {
            self.detach(channel);
            return Err(TransportError::Subscription(e.to_string()));
        }
        debug!("Subscribed to {}", channel);
        Ok(())
    }

    pub(crate) async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let Some(characteristic) = self.characteristic(channel) else {
            return Ok(());
        };
        if !self.detach(channel) {
            return Ok(());
        }
        self.peripheral
            .unsubscribe(characteristic)
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))
    }

    pub(crate) async fn write(
        &self,
        channel: Channel,
        payload: &[u8],
        reliability: WriteReliability,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel).ok_or_else(|| {
            TransportError::Write(format!("{} characteristic not found", channel))
        })?;
        let write_type = match reliability {
            WriteReliability::Acknowledged => WriteType::WithResponse,
            WriteReliability::FireAndForget => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(characteristic, payload, write_type)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    /// Drop every handler, e.g. after the peripheral went away on its own.
    pub(crate) fn clear_handlers(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    pub(crate) async fn close(&self) -> Result<(), TransportError> {
        self.clear_handlers();
        self.dispatcher.abort();
        let connected = self.peripheral.is_connected().await.unwrap_or(false);
        if connected {
            self.peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    fn detach(&self, channel: Channel) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .is_some()
    }
}

/// Slot holding at most one live session
#[derive(Default, Clone)]
pub(crate) struct SessionSlot {
    inner: Arc<Mutex<Option<Arc<GattSession>>>>,
}

impl SessionSlot {
    pub(crate) fn get(&self) -> Option<Arc<GattSession>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace(&self, session: Option<Arc<GattSession>>) -> Option<Arc<GattSession>> {
        std::mem::replace(
            &mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            session,
        )
    }

    pub(crate) fn take(&self) -> Option<Arc<GattSession>> {
        self.replace(None)
    }
}
