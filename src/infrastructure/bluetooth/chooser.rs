//! Chooser Adapter Module
//!
//! Device selection is user-driven: a scan surveys nearby advertisers for a
//! short window, hands the candidates to a [`DeviceChooser`] and reports at
//! most one device. There is no passive scanning, so `stop_scan` is a no-op.

use crate::domain::models::{DeviceHandle, ScanOptions};
use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::session::{self, GattSession, HostCentral, SessionSlot};
use crate::infrastructure::bluetooth::transport::{
    DeviceCallback, NotificationHandler, TransportAdapter, TransportError, WriteReliability,
};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::Peripheral;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

/// Picks one device out of the surveyed candidates, or `None` to cancel.
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    async fn choose(&self, candidates: Vec<DeviceHandle>) -> Option<DeviceHandle>;
}

/// Survey time before the chooser is shown
const SURVEY_WINDOW: Duration = Duration::from_secs(3);

pub struct ChooserAdapter {
    central: HostCentral,
    chooser: Arc<dyn DeviceChooser>,
    survey_window: Duration,
    connect_timeout: Duration,
    selected: Mutex<Option<Peripheral>>,
    session: SessionSlot,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChooserAdapter {
    pub fn new(
        chooser: Arc<dyn DeviceChooser>,
        scan_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            central: HostCentral::default(),
            chooser,
            survey_window: SURVEY_WINDOW.min(scan_timeout),
            connect_timeout,
            selected: Mutex::new(None),
            session: SessionSlot::default(),
            watcher: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<Arc<GattSession>, TransportError> {
        self.session.get().ok_or(TransportError::NotConnected)
    }

    /// Forget the session when the peripheral drops the link on its own.
    async fn watch_disconnect(&self, session: &Arc<GattSession>) {
        let Ok(central) = self.central.adapter().await else {
            return;
        };
        let Ok(mut events) = central.events().await else {
            return;
        };
        let id = session.peripheral().id();
        let slot = self.session.clone();
        let watched = Arc::downgrade(session);

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone != id {
                        continue;
                    }
                    info!("Peripheral disconnected");
                    if let Some(session) = watched.upgrade() {
                        session.clear_handlers();
                        let current = slot.get();
                        if current.is_some_and(|c| Arc::ptr_eq(&c, &session)) {
                            slot.take();
                        }
                    }
                    break;
                }
            }
        });

        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }
}

#[async_trait]
impl TransportAdapter for ChooserAdapter {
    fn name(&self) -> &'static str {
        "chooser"
    }

    async fn is_available(&self) -> bool {
        self.central.is_available().await
    }

    async fn scan(
        &self,
        on_device: DeviceCallback,
        options: ScanOptions,
    ) -> Result<(), TransportError> {
        let central = self.central.adapter().await?;

        // Filter on the requested services when given; otherwise show everything.
        let filter = ScanFilter {
            services: options.service_uuids.clone(),
        };
        central
            .start_scan(filter)
            .await
            .map_err(|e| TransportError::ScanFailure(e.to_string()))?;
        tokio::time::sleep(self.survey_window).await;
        if let Err(e) = central.stop_scan().await {
            debug!("Failed to stop survey scan: {}", e);
        }

        // The central also lists peripherals cached from earlier scans, so the
        // service filter is applied again on what each one advertised.
        let peripherals = central
            .peripherals()
            .await
            .map_err(|e| TransportError::ScanFailure(e.to_string()))?;
        let mut candidates = Vec::new();
        let mut offered = Vec::new();
        for peripheral in peripherals {
            let advertisement = session::describe(&peripheral).await;
            if !session::advertises_any(&advertisement.services, &options.service_uuids) {
                trace!("Skipping {}: service not advertised", advertisement.device.id);
                continue;
            }
            candidates.push(advertisement.device);
            offered.push(peripheral);
        }
        info!("Offering {} device(s) to the chooser", candidates.len());

        let chosen = self
            .chooser
            .choose(candidates)
            .await
            .ok_or_else(|| TransportError::ScanFailure("No device selected".to_string()))?;

        let peripheral = offered
            .into_iter()
            .find(|p| p.id().to_string() == chosen.id)
            .ok_or_else(|| {
                TransportError::ScanFailure(format!("Device {} is no longer available", chosen.id))
            })?;

        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(peripheral);
        on_device(chosen);
        Ok(())
    }

    async fn stop_scan(&self) {}

    async fn connect(&self, _device: &DeviceHandle) -> Result<(), TransportError> {
        let peripheral = self
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NoDeviceSelected)?;

        if let Some(stale) = self.session.take() {
            warn!("Replacing an existing session");
            if let Err(e) = stale.close().await {
                debug!("Failed to close the previous session: {}", e);
            }
        }

        let session = Arc::new(GattSession::open(peripheral, self.connect_timeout).await?);
        self.watch_disconnect(&session).await;
        self.session.replace(Some(session));
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
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cancel;

    #[async_trait]
    impl DeviceChooser for Cancel {
        async fn choose(&self, _candidates: Vec<DeviceHandle>) -> Option<DeviceHandle> {
            None
        }
    }

    fn adapter() -> ChooserAdapter {
        ChooserAdapter::new(Arc::new(Cancel), Duration::from_secs(1), Duration::from_secs(1))
    }

    #[test]
    fn test_survey_window_bounded_by_scan_timeout() {
        assert_eq!(adapter().survey_window, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_requires_selection() {
        let adapter = adapter();
        let device = DeviceHandle::new("x", None, None);
        assert_eq!(
            adapter.connect(&device).await,
            Err(TransportError::NoDeviceSelected)
        );
    }

    #[tokio::test]
    async fn test_teardown_without_session() {
        let adapter = adapter();
        adapter.stop_scan().await;
        assert_eq!(adapter.unsubscribe(Channel::HeartbeatIn).await, Ok(()));
        assert_eq!(adapter.disconnect().await, Ok(()));
        assert_eq!(adapter.disconnect().await, Ok(()));
    }
}
