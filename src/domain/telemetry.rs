//! Observer-side telemetry interpretation
//!
//! The link core passes telemetry through as raw text. Screens that care about
//! its content classify it here: either a short token such as `MANUAL`, or a
//! JSON report carrying at least a `mode` field.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryReport {
    pub mode: String,
    #[serde(default)]
    pub risk: Option<f64>,
    #[serde(default, rename = "headingDeg", alias = "heading_deg", alias = "heading")]
    pub heading_deg: Option<f64>,
    #[serde(
        default,
        rename = "distanceMeters",
        alias = "distance_m",
        alias = "distance"
    )]
    pub distance_m: Option<f64>,
}

impl TelemetryReport {
    /// Risk clamped to [0, 1]
    pub fn risk(&self) -> Option<f64> {
        self.risk.filter(|r| r.is_finite()).map(|r| r.clamp(0.0, 1.0))
    }

    pub fn direction(&self) -> Option<&'static str> {
        self.heading_deg.map(compass_direction)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Token(String),
    Report(TelemetryReport),
}

impl Telemetry {
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            if let Ok(report) = serde_json::from_str::<TelemetryReport>(trimmed) {
                return Self::Report(report);
            }
        }
        Self::Token(trimmed.to_string())
    }

    pub fn mode(&self) -> &str {
        match self {
            Self::Token(token) => token,
            Self::Report(report) => &report.mode,
        }
    }
}

/// Eight-wind compass label, 0° = north, clockwise
pub fn compass_direction(degrees: f64) -> &'static str {
    const DIRS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    if !degrees.is_finite() {
        return DIRS[0];
    }
    let idx = (degrees.rem_euclid(360.0) / 45.0).round() as usize % 8;
    DIRS[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_token() {
        assert_eq!(
            Telemetry::classify("MANUAL\n"),
            Telemetry::Token("MANUAL".to_string())
        );
        assert_eq!(Telemetry::classify(" STOP ").mode(), "STOP");
    }

    #[test]
    fn test_json_report() {
        let t = Telemetry::classify(r#"{"mode":"AUTO","risk":1.4,"headingDeg":92,"distanceMeters":3.5}"#);
        assert_eq!(t.mode(), "AUTO");
        let Telemetry::Report(report) = t else {
            panic!("expected a report");
        };
        assert_eq!(report.mode, "AUTO");
        assert_eq!(report.risk(), Some(1.0));
        assert_eq!(report.direction(), Some("E"));
        assert_eq!(report.distance_m, Some(3.5));
    }

    #[test]
    fn test_json_without_mode_is_token() {
        let raw = r#"{"risk":0.2}"#;
        assert_eq!(Telemetry::classify(raw), Telemetry::Token(raw.to_string()));
    }

    #[test]
    fn test_compass_wraps() {
        assert_eq!(compass_direction(0.0), "N");
        assert_eq!(compass_direction(350.0), "N");
        assert_eq!(compass_direction(-45.0), "NW");
        assert_eq!(compass_direction(180.0), "S");
        assert_eq!(compass_direction(224.0), "SW");
    }
}
