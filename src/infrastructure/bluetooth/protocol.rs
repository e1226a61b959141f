//! RoboCar Link Protocol
//!
//! GATT layout and payload codec shared by every transport adapter and the
//! peripheral firmware. Any change here breaks interoperability.

use crate::domain::models::StructuredCommand;
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// RoboCar control service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xb07498ca_ad5b_474e_940d_16f1a71141e0);

/// Heartbeat ping, peripheral → app (notify)
pub const HEARTBEAT_IN_CHAR_UUID: Uuid = Uuid::from_u128(0xc1ff12bb_3ed8_46e5_b4f9_a6ca6092d345);

/// Heartbeat reply, app → peripheral (write without response)
pub const HEARTBEAT_OUT_CHAR_UUID: Uuid = Uuid::from_u128(0xd7add780_b042_4876_aae1_112855353cc1);

/// Mode tokens and structured motion commands, app → peripheral
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0xe2f3c4d5_6789_4abc_def0_1234567890ab);

/// Telemetry text, peripheral → app (notify)
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0xf1e2d3c4_b5a6_4789_8abc_0def12345678);

/// Fixed heartbeat reply
pub const HEARTBEAT_REPLY: &[u8] = b"PONG";

/// Addressable endpoints of the control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    HeartbeatIn,
    HeartbeatOut,
    Command,
    Telemetry,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::HeartbeatIn,
        Channel::HeartbeatOut,
        Channel::Command,
        Channel::Telemetry,
    ];

    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            Self::HeartbeatIn => HEARTBEAT_IN_CHAR_UUID,
            Self::HeartbeatOut => HEARTBEAT_OUT_CHAR_UUID,
            Self::Command => COMMAND_CHAR_UUID,
            Self::Telemetry => TELEMETRY_CHAR_UUID,
        }
    }

    pub fn from_characteristic(uuid: Uuid) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.characteristic_uuid() == uuid)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HeartbeatIn => "heartbeat-in",
            Self::HeartbeatOut => "heartbeat-out",
            Self::Command => "command",
            Self::Telemetry => "telemetry",
        })
    }
}

/// Mode-change tokens written to the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    /// Hand control to the app (joystick driving)
    Manual,
    /// Start autonomous driving
    Auto,
}

impl ModeCommand {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Manual => b"MANUAL",
            Self::Auto => b"START",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode structured command: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a structured command as compact JSON, fields in insertion order.
///
/// Integral values are written without a fractional part (`-1.0` → `-1`) and
/// non-finite values as `null`, which is what the firmware's parser expects.
pub fn encode_structured(command: &StructuredCommand) -> Result<Vec<u8>, CodecError> {
    let mut object = Map::new();
    for (key, value) in command.fields() {
        object.insert(key.to_string(), json_number(value));
    }
    Ok(serde_json::to_vec(&Value::Object(object))?)
}

/// Decode an inbound notification as text. Invalid UTF-8 is replaced, not rejected.
pub fn decode_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn json_number(value: f64) -> Value {
    // 2^53: beyond this an f64 no longer represents every integer exactly
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;

    if value.is_finite() && value.fract() == 0.0 && value.abs() <= MAX_SAFE {
        return Value::from(value as i64);
    }
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_layout() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "b07498ca-ad5b-474e-940d-16f1a71141e0"
        );
        assert_eq!(
            Channel::Command.characteristic_uuid().to_string(),
            "e2f3c4d5-6789-4abc-def0-1234567890ab"
        );
        assert_eq!(
            Channel::from_characteristic(TELEMETRY_CHAR_UUID),
            Some(Channel::Telemetry)
        );
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(ModeCommand::Manual.as_bytes(), b"MANUAL");
        assert_eq!(ModeCommand::Auto.as_bytes(), b"START");
        assert_eq!(HEARTBEAT_REPLY.len(), 4);
    }

    #[test]
    fn test_joystick_encoding() {
        let payload = encode_structured(&StructuredCommand::joystick(0.5, -1.0)).unwrap();
        assert_eq!(payload, br#"{"x":0.5,"y":-1}"#);
    }

    #[test]
    fn test_field_order_and_non_finite() {
        let cmd = StructuredCommand::new()
            .field("speed", f64::NAN)
            .field("angle", -0.0)
            .field("a", 0.25);
        let payload = encode_structured(&cmd).unwrap();
        assert_eq!(payload, br#"{"speed":null,"angle":0,"a":0.25}"#);
    }

    #[test]
    fn test_empty_command_is_empty_object() {
        assert_eq!(encode_structured(&StructuredCommand::new()).unwrap(), b"{}");
    }

    #[test]
    fn test_decode_text_is_lossy() {
        assert_eq!(decode_text(b"MANUAL"), "MANUAL");
        assert_eq!(decode_text(&[0x4f, 0x4b, 0xff]), "OK\u{fffd}");
    }
}
