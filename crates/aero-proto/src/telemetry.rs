use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::{PositionNed, VelocityNed};

/// Flight mode as reported by the autopilot, reduced to what the engine reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightMode {
    #[default]
    Unknown,
    Manual,
    Hold,
    Takeoff,
    Land,
    Offboard,
    Mission,
    ReturnToLaunch,
    Other,
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlightMode::Unknown => "UNKNOWN",
            FlightMode::Manual => "MANUAL",
            FlightMode::Hold => "HOLD",
            FlightMode::Takeoff => "TAKEOFF",
            FlightMode::Land => "LAND",
            FlightMode::Offboard => "OFFBOARD",
            FlightMode::Mission => "MISSION",
            FlightMode::ReturnToLaunch => "RTL",
            FlightMode::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// Vehicle telemetry at one instant. Replaced wholesale every control cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub armed: bool,
    pub in_air: bool,
    pub flight_mode: FlightMode,
    pub position: PositionNed,
    pub velocity: VelocityNed,
    /// Percent 0-100, None until the autopilot reports it.
    pub battery_percent: Option<f32>,
    pub relative_altitude_m: f64,
}

impl VehicleSnapshot {
    pub fn battery_below(&self, threshold_pct: f32) -> bool {
        self.battery_percent.map(|p| p < threshold_pct).unwrap_or(false)
    }
}

impl fmt::Display for VehicleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mode={} pos=N{:.1} E{:.1} D{:.1} alt={:.1}m speed={:.1}m/s bat={}",
            if self.in_air { "flying" } else { "grounded" },
            if self.armed { "armed" } else { "disarmed" },
            self.flight_mode,
            self.position.north_m,
            self.position.east_m,
            self.position.down_m,
            self.relative_altitude_m,
            self.velocity.ground_speed_m_s(),
            self.battery_percent.map(|p| format!("{:.0}%", p)).unwrap_or_else(|| "n/a".into()),
        )
    }
}
