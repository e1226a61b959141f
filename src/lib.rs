//! RoboCar link core: BLE connection state machine, heartbeat responder,
//! command API and state broadcast for the RoboCar remote-control app.

pub mod domain;
pub mod infrastructure;
