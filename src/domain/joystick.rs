//! Joystick input shaping
//!
//! Turns raw widget events (normalized ⟨x, y⟩ in [-1, 1], +y up) into the
//! structured commands streamed to the peripheral. Moves are rate limited so a
//! fast touch stream does not saturate the link; releases always go out.

use crate::domain::models::StructuredCommand;
use crate::domain::settings::JoystickSettings;
use std::time::{Duration, Instant};

pub struct JoystickShaper {
    dead_zone: f64,
    min_interval: Duration,
    last_sent: Option<Instant>,
    last_axes: Option<(f64, f64)>,
}

impl JoystickShaper {
    pub fn new(settings: &JoystickSettings) -> Self {
        Self {
            dead_zone: settings.dead_zone.clamp(0.0, 1.0),
            min_interval: Duration::from_millis(settings.min_interval_ms),
            last_sent: None,
            last_axes: None,
        }
    }

    /// Shape a move event. Returns `None` when the event is throttled or
    /// repeats the previously sent axes.
    pub fn on_move(&mut self, x: f64, y: f64, now: Instant) -> Option<StructuredCommand> {
        let axes = (self.shape(x), self.shape(y));

        if self.last_axes == Some(axes) {
            return None;
        }
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }

        self.last_sent = Some(now);
        self.last_axes = Some(axes);
        Some(StructuredCommand::joystick(axes.0, axes.1))
    }

    /// Knob released: always emits the neutral command and resets the throttle.
    pub fn on_release(&mut self) -> StructuredCommand {
        self.last_sent = None;
        self.last_axes = Some((0.0, 0.0));
        StructuredCommand::joystick(0.0, 0.0)
    }

    fn shape(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let value = value.clamp(-1.0, 1.0);
        if value.abs() < self.dead_zone {
            0.0
        } else {
            value
        }
    }
}
