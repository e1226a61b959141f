//! Native Adapter Module
//!
//! Passive BLE discovery on the host stack. The central's peripheral list is
//! polled while the scan runs, so devices the OS already cached from earlier
//! scans are found again. Each matching device is reported once per scan,
//! until the scan is stopped or the scan window elapses.

use crate::domain::models::{DeviceHandle, ScanOptions};
use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::session::{
    self, Advertisement, GattSession, HostCentral, SessionSlot,
};
use crate::infrastructure::bluetooth::transport::{
    DeviceCallback, NotificationHandler, TransportAdapter, TransportError, WriteReliability,
};
use async_trait::async_trait;
use btleplug::api::{Central, ScanFilter};
use btleplug::platform::Peripheral;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the peripheral list is re-read during a scan
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct NativeAdapter {
    central: HostCentral,
    name_prefix: Option<String>,
    scan_window: Duration,
    connect_timeout: Duration,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    discovered: Arc<Mutex<HashMap<String, Peripheral>>>,
    session: SessionSlot,
}

impl NativeAdapter {
    pub fn new(name_prefix: Option<String>, scan_window: Duration, connect_timeout: Duration) -> Self {
        Self {
            central: HostCentral::default(),
            name_prefix,
            scan_window,
            connect_timeout,
            scan_task: Mutex::new(None),
            discovered: Arc::default(),
            session: SessionSlot::default(),
        }
    }

    fn is_scanning(&self) -> bool {
        self.scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn session(&self) -> Result<Arc<GattSession>, TransportError> {
        self.session.get().ok_or(TransportError::NotConnected)
    }
}

/// Names can arrive in a later advertisement, so a rejected device is
/// re-checked on the next poll.
fn accepts(advertisement: &Advertisement, prefix: Option<&str>, options: &ScanOptions) -> bool {
    matches_prefix(&advertisement.device, prefix)
        && (options.accept_all_devices
            || session::advertises_any(&advertisement.services, &options.service_uuids))
}

fn matches_prefix(device: &DeviceHandle, prefix: Option<&str>) -> bool {
    match prefix {
        None => true,
        Some(prefix) => device
            .name
            .as_deref()
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false),
    }
}

#[async_trait]
impl TransportAdapter for NativeAdapter {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn is_available(&self) -> bool {
        self.central.is_available().await
    }

    async fn scan(
        &self,
        on_device: DeviceCallback,
        options: ScanOptions,
    ) -> Result<(), TransportError> {
        if self.is_scanning() {
            debug!("Scan already running");
            return Ok(());
        }

        let central = self.central.adapter().await?.clone();
        let filter = if options.accept_all_devices {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: options.service_uuids.clone(),
            }
        };

        central
            .start_scan(filter)
            .await
            .map_err(|e| TransportError::ScanFailure(e.to_string()))?;
        info!("Native scan started ({:?} window)", self.scan_window);

        self.discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let discovered = self.discovered.clone();
        let prefix = self.name_prefix.clone();
        let window = tokio::time::sleep(self.scan_window);
        let task = tokio::spawn(async move {
            tokio::pin!(window);
            let mut poll = tokio::time::interval(POLL_INTERVAL);
            let mut reported = HashSet::new();
            loop {
                tokio::select! {
                    _ = &mut window => {
                        info!("Scan window elapsed");
                        break;
                    }
                    _ = poll.tick() => {}
                }

                let peripherals = match central.peripherals().await {
                    Ok(peripherals) => peripherals,
                    Err(e) => {
                        warn!("Failed to list peripherals: {}", e);
                        continue;
                    }
                };
                for peripheral in peripherals {
                    let advertisement = session::describe(&peripheral).await;
                    let device = &advertisement.device;
                    if reported.contains(&device.id)
                        || !accepts(&advertisement, prefix.as_deref(), &options)
                    {
                        continue;
                    }
                    debug!("Discovered {} ({})", device.display_name(), device.id);
                    reported.insert(device.id.clone());
                    discovered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(device.id.clone(), peripheral);
                    on_device(advertisement.device);
                }
            }
            if let Err(e) = central.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });

        *self.scan_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn stop_scan(&self) {
        let task = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        task.abort();
        if let Ok(central) = self.central.adapter().await {
            if let Err(e) = central.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        }
        info!("Native scan stopped");
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let peripheral = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device.id)
            .cloned()
            .ok_or_else(|| TransportError::Connection(format!("Unknown device {}", device.id)))?;

        if let Some(stale) = self.session.take() {
            warn!("Replacing an existing session");
            if let Err(e) = stale.close().await {
                debug!("Failed to close the previous session: {}", e);
            }
        }

        info!("Connecting to {}", device.display_name());
        let session = GattSession::open(peripheral, self.connect_timeout).await?;
        self.session.replace(Some(Arc::new(session)));
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Channel,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError> {
        self.session()?.subscribe(channel, on_data).await
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        match self.session.get() {
            Some(session) => session.unsubscribe(channel).await,
            None => Ok(()),
        }
    }

    async fn write(
        &self,
        channel: Channel,
        payload: &[u8],
        reliability: WriteReliability,
    ) -> Result<(), TransportError> {
        self.session()?.write(channel, payload, reliability).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_scan().await;
        match self.session.take() {
            Some(session) => {
                info!("Closing native session");
                session.close().await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_filter() {
        let car = DeviceHandle::new("1", Some("RoboCar-7".into()), None);
        let anon = DeviceHandle::new("2", None, None);
        assert!(matches_prefix(&car, None));
        assert!(matches_prefix(&anon, None));
        assert!(matches_prefix(&car, Some("RoboCar")));
        assert!(!matches_prefix(&anon, Some("RoboCar")));
    }

    #[test]
    fn test_scan_options_filter() {
        let advertisement = |name: &str, services: Vec<uuid::Uuid>| Advertisement {
            device: DeviceHandle::new("1", Some(name.into()), None),
            services,
        };
        let service = crate::infrastructure::bluetooth::protocol::SERVICE_UUID;
        let filtered = ScanOptions {
            service_uuids: vec![service],
            accept_all_devices: false,
        };

        assert!(accepts(&advertisement("Anything", vec![]), None, &ScanOptions::for_service(service)));
        assert!(accepts(&advertisement("RoboCar", vec![service]), Some("Robo"), &filtered));
        assert!(!accepts(&advertisement("RoboCar", vec![]), Some("Robo"), &filtered));
        assert!(!accepts(&advertisement("Speaker", vec![service]), Some("Robo"), &filtered));
    }

    #[tokio::test]
    async fn test_idle_adapter_operations_are_no_ops() {
        let adapter = NativeAdapter::new(None, Duration::from_secs(1), Duration::from_secs(1));
        adapter.stop_scan().await;
        assert_eq!(adapter.unsubscribe(Channel::Telemetry).await, Ok(()));
        assert_eq!(adapter.disconnect().await, Ok(()));
        assert_eq!(
            adapter
                .write(Channel::Command, b"MANUAL", WriteReliability::Acknowledged)
                .await,
            Err(TransportError::NotConnected)
        );
    }
}
