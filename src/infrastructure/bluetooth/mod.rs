//! Bluetooth Module
//!
//! Provides the BLE link to the RoboCar peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkManager                         │
//! │  (state machine, heartbeat, commands, observer fan-out)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ TransportAdapter
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────┐           ┌───────────────┐
//! │ NativeAdapter │           │ ChooserAdapter│
//! │ - passive scan│           │ - user picks  │
//! └───────┬───────┘           └───────┬───────┘
//!         └───────────┬───────────────┘
//!                     ▼
//!              ┌─────────────┐      ┌──────────┐
//!              │ GattSession │      │ Protocol │
//!              │ - notify    │      │ - UUIDs  │
//!              │ - write     │      │ - codec  │
//!              └─────────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT layout and payload codec
//! - [`transport`] - adapter contract, error taxonomy and adapter selection
//! - [`native`] / [`chooser`] - the two btleplug-backed adapters
//! - [`session`] - GATT session plumbing shared by the adapters
//! - [`observers`] - observer registry
//! - [`service`] - the link manager

pub mod chooser;
pub mod native;
pub mod observers;
pub mod protocol;
pub mod service;
pub mod transport;

mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use chooser::{ChooserAdapter, DeviceChooser};
pub use native::NativeAdapter;
pub use observers::ObserverId;
pub use service::{LinkError, LinkManager};
pub use transport::{build_adapter, TransportAdapter, TransportError, WriteReliability};
