//! Scripted in-memory transport used by the link manager tests.

use crate::domain::models::{DeviceHandle, ScanOptions};
use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::transport::{
    DeviceCallback, NotificationHandler, TransportAdapter, TransportError, WriteReliability,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub channel: Channel,
    pub payload: Vec<u8>,
    pub reliability: WriteReliability,
}

/// Knobs a test can turn before or between calls
#[derive(Default)]
pub struct Script {
    pub unavailable: bool,
    pub devices: Vec<DeviceHandle>,
    pub scan_error: Option<TransportError>,
    pub connect_error: Option<TransportError>,
    pub subscribe_errors: HashMap<Channel, TransportError>,
    pub write_error: Option<TransportError>,
    pub disconnect_error: Option<TransportError>,
    /// When set, `connect` parks until notified
    pub connect_gate: Option<Arc<Notify>>,
    /// When set, the next `disconnect` parks until notified before tearing down
    pub disconnect_gate: Option<Arc<Notify>>,
}

#[derive(Default)]
pub struct MockAdapter {
    script: Mutex<Script>,
    connected: Mutex<bool>,
    handlers: Mutex<HashMap<Channel, NotificationHandler>>,
    writes: Mutex<Vec<WriteRecord>>,
    calls: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn with_devices(devices: Vec<DeviceHandle>) -> Self {
        let adapter = Self::default();
        adapter.script().devices = devices;
        adapter
    }

    pub fn with_device(name: &str) -> Self {
        Self::with_devices(vec![DeviceHandle::new(
            format!("{}-id", name),
            Some(name.to_string()),
            Some(-55),
        )])
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<Channel> {
        self.handlers.lock().unwrap().keys().copied().collect()
    }

    pub fn handler(&self, channel: Channel) -> Option<NotificationHandler> {
        self.handlers.lock().unwrap().get(&channel).cloned()
    }

    /// Deliver a notification the way a real adapter would. Returns `false`
    /// when nothing is subscribed to `channel`.
    pub async fn notify(&self, channel: Channel, payload: &[u8]) -> bool {
        match self.handler(channel) {
            Some(handler) => {
                handler(payload.to_vec()).await;
                true
            }
            None => false,
        }
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        !self.script().unavailable
    }

    async fn scan(
        &self,
        on_device: DeviceCallback,
        _options: ScanOptions,
    ) -> Result<(), TransportError> {
        self.log("scan".to_string());
        let (error, devices) = {
            let script = self.script();
            (script.scan_error.clone(), script.devices.clone())
        };
        if let Some(error) = error {
            return Err(error);
        }
        for device in devices {
            on_device(device);
        }
        Ok(())
    }

    async fn stop_scan(&self) {
        self.log("stop_scan".to_string());
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.log(format!("connect {}", device.display_name()));
        let gate = self.script().connect_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.script().connect_error.clone() {
            return Err(error);
        }
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Channel,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError> {
        self.log(format!("subscribe {}", channel));
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = self.script().subscribe_errors.get(&channel).cloned() {
            return Err(error);
        }
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&channel) {
            return Err(TransportError::Subscription(format!(
                "{} already subscribed",
                channel
            )));
        }
        handlers.insert(channel, on_data);
        Ok(())
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        self.handlers.lock().unwrap().remove(&channel);
        Ok(())
    }

    async fn write(
        &self,
        channel: Channel,
        payload: &[u8],
        reliability: WriteReliability,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = self.script().write_error.clone() {
            return Err(error);
        }
        self.writes.lock().unwrap().push(WriteRecord {
            channel,
            payload: payload.to_vec(),
            reliability,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.log("disconnect".to_string());
        let gate = self.script().disconnect_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.handlers.lock().unwrap().clear();
        *self.connected.lock().unwrap() = false;
        match self.script().disconnect_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
