// Define message types for the HTTP control surface

use serde::{Deserialize, Serialize};

use crate::config::SPEED_DEFAULT;
use crate::input::Intent;
use crate::motor::WheelPair;

// Command from the joystick page -> runtime
// Every field is optional on the wire; missing fields fall back to their defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_speed() -> f32 {
    SPEED_DEFAULT
}

impl Default for CommandRequest {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            speed: SPEED_DEFAULT,
        }
    }
}

impl CommandRequest {
    /// Parse a request body, treating anything unreadable as a stop
    pub fn from_body(body: &[u8]) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
    }

    pub fn intent(&self) -> Intent {
        Intent::new(self.x, self.y)
    }
}

// Wheel commands actually issued, after clamping and speed scaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub left: f32,
    pub right: f32,
    pub speed: f32,
}

impl CommandResponse {
    pub fn new(wheels: WheelPair, speed: f32) -> Self {
        Self {
            left: wheels.left,
            right: wheels.right,
            speed,
        }
    }
}

/// Telemetry report served by the status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub battery_voltage: f32,
    pub battery_percentage: u8,
    pub motor_current: f32,
    pub motor_temp: f32,
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default() {
        let req = CommandRequest::from_body(br#"{"y": 0.5}"#).unwrap();
        assert_eq!(req.x, 0.0);
        assert_eq!(req.y, 0.5);
        assert_eq!(req.speed, 1.0);

        let req = CommandRequest::from_body(b"").unwrap();
        assert_eq!(req, CommandRequest::default());
        assert_eq!(req.speed, 1.0);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let req = CommandRequest::from_body(br#"{"x": -1, "speed": 2, "seq": 7}"#).unwrap();
        assert_eq!(req.x, -1.0);
        assert_eq!(req.speed, 2.0);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(CommandRequest::from_body(b"{x:").is_err());
    }

    #[test]
    fn test_status_field_names() {
        let json = serde_json::to_value(StatusReport {
            battery_voltage: 15.0,
            battery_percentage: 57,
            motor_current: 1.5,
            motor_temp: 30.0,
            uptime: 12,
        })
        .unwrap();
        for key in [
            "battery_voltage",
            "battery_percentage",
            "motor_current",
            "motor_temp",
            "uptime",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["battery_percentage"], 57);
        assert_eq!(json["uptime"], 12);
    }
}
