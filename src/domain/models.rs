use std::fmt;
use uuid::Uuid;

/// Phase of the single peripheral link.
///
/// The label of each phase doubles as the status text shown to users, so the
/// `Display` impl is part of the observable contract.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Scanning,
    /// Cosmetic sub-state of `Scanning`, carries the device label.
    DeviceFound(String),
    Connecting,
    ConnectedSubscribing,
    Subscribed,
    /// Terminal for one attempt; behaves like `Disconnected` with an error.
    FailedToConnect,
}

impl LinkPhase {
    /// A new connect attempt may only start from an idle phase.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::FailedToConnect)
    }

    /// Outbound commands are only accepted while subscribed.
    pub fn is_operating(&self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Scanning => f.write_str("Scanning..."),
            Self::DeviceFound(label) => write!(f, "Device found: {}", label),
            Self::Connecting => f.write_str("Connecting..."),
            Self::ConnectedSubscribing => f.write_str("Connected. Subscribing..."),
            Self::Subscribed => f.write_str("Subscribed! RTT loop active."),
            Self::FailedToConnect => f.write_str("Failed to connect"),
        }
    }
}

/// Snapshot handed to every observer. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkState {
    pub phase: LinkPhase,
    pub error: Option<String>,
    pub last_telemetry: Option<String>,
}

impl LinkState {
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Human-readable status label
    pub fn status(&self) -> String {
        self.phase.to_string()
    }

    pub fn is_subscribed(&self) -> bool {
        self.phase.is_operating()
    }

    pub fn with_phase(&self, phase: LinkPhase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    pub fn with_error(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.clone()
        }
    }

    pub fn without_error(&self) -> Self {
        Self {
            error: None,
            ..self.clone()
        }
    }

    pub fn with_telemetry(&self, telemetry: String) -> Self {
        Self {
            last_telemetry: Some(telemetry),
            ..self.clone()
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if let Some(error) = &self.error {
            write!(f, " | error: {}", error)?;
        }
        if let Some(telemetry) = &self.last_telemetry {
            write!(f, " | telemetry: {}", telemetry)?;
        }
        Ok(())
    }
}

/// A device surfaced by a scan. The id is opaque and owned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Advertised name, or the id when the device did not advertise one
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Services the device must expose. Chooser-based adapters also need these
    /// listed up front to be granted access to them after connecting.
    pub service_uuids: Vec<Uuid>,
    /// Surface every advertisement instead of filtering by service.
    pub accept_all_devices: bool,
}

impl ScanOptions {
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service_uuids: vec![service],
            accept_all_devices: true,
        }
    }
}

/// Flat, ordered set of numeric fields sent as one structured command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredCommand {
    fields: Vec<(String, f64)>,
}

impl StructuredCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joystick axes, normalized to [-1, 1] with +y pointing up
    pub fn joystick(x: f64, y: f64) -> Self {
        Self::new().field("x", x).field("y", y)
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}
