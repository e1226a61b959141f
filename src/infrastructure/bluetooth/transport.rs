//! Transport Adapter contract
//!
//! Capability set the link manager is written against. Two concrete adapters
//! implement it: [`NativeAdapter`] (passive scanning on the host stack) and
//! [`ChooserAdapter`] (one user-picked device, no passive scanning).

use crate::domain::models::{DeviceHandle, ScanOptions};
use crate::domain::settings::{Settings, TransportKind};
use crate::infrastructure::bluetooth::chooser::{ChooserAdapter, DeviceChooser};
use crate::infrastructure::bluetooth::native::NativeAdapter;
use crate::infrastructure::bluetooth::protocol::Channel;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Invoked for every device a scan surfaces. Adapters drop their clone when
/// the scan ends, which is how the caller learns nothing more is coming.
pub type DeviceCallback = Arc<dyn Fn(DeviceHandle) + Send + Sync>;

pub type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Inbound notification handler. Adapters await the returned future before
/// dispatching the next notification, so handlers observe delivery order.
pub type NotificationHandler = Arc<dyn Fn(Vec<u8>) -> NotificationFuture + Send + Sync>;

/// How a characteristic write waits on the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReliability {
    /// Wait for the peripheral's acknowledgment
    Acknowledged,
    /// Write without response, for latency-sensitive streams
    FireAndForget,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("{0}")]
    ScanFailure(String),
    #[error("{0}")]
    Connection(String),
    #[error("{0}")]
    Subscription(String),
    #[error("Not connected")]
    NotConnected,
    #[error("{0}")]
    Write(String),
    #[error("No device selected yet (call scan first)")]
    NoDeviceSelected,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether the platform exposes a usable BLE stack
    async fn is_available(&self) -> bool;

    /// Begin discovery, reporting devices through `on_device`.
    async fn scan(&self, on_device: DeviceCallback, options: ScanOptions)
        -> Result<(), TransportError>;

    /// Idempotent; no-op when not scanning.
    async fn stop_scan(&self);

    /// Open a GATT session to a device previously reported by `scan`.
    async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError>;

    /// Enable notifications on `channel` and attach exactly one handler.
    async fn subscribe(
        &self,
        channel: Channel,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Detach the handler. No-op when not connected or not subscribed.
    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError>;

    async fn write(
        &self,
        channel: Channel,
        payload: &[u8],
        reliability: WriteReliability,
    ) -> Result<(), TransportError>;

    /// Tear down the session and all subscriptions. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Build the adapter selected in settings. Resolved once by the composition root.
pub fn build_adapter(
    settings: &Settings,
    chooser: Arc<dyn DeviceChooser>,
) -> Arc<dyn TransportAdapter> {
    match settings.transport {
        TransportKind::Native => Arc::new(NativeAdapter::new(
            settings.device_name_prefix.clone(),
            settings.scan_timeout(),
            settings.connect_timeout(),
        )),
        TransportKind::Chooser => Arc::new(ChooserAdapter::new(
            chooser,
            settings.scan_timeout(),
            settings.connect_timeout(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_message_is_verbatim() {
        let err = TransportError::Connection("timeout".to_string());
        assert_eq!(err.to_string(), "timeout");
        assert_eq!(TransportError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_build_adapter_follows_settings() {
        struct NeverChoose;

        #[async_trait]
        impl DeviceChooser for NeverChoose {
            async fn choose(&self, _candidates: Vec<DeviceHandle>) -> Option<DeviceHandle> {
                None
            }
        }

        let mut settings = Settings::default();
        let chooser: Arc<dyn DeviceChooser> = Arc::new(NeverChoose);

        assert_eq!(build_adapter(&settings, chooser.clone()).name(), "native");
        settings.transport = TransportKind::Chooser;
        assert_eq!(build_adapter(&settings, chooser).name(), "chooser");
    }
}
