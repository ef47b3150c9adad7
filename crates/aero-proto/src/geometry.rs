use serde::{Deserialize, Serialize};

/// Local North-East-Down position relative to the takeoff origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionNed {
    pub north_m: f64,
    pub east_m: f64,
    pub down_m: f64,
}

impl PositionNed {
    pub fn new(north_m: f64, east_m: f64, down_m: f64) -> Self {
        Self { north_m, east_m, down_m }
    }

    /// Height above the origin (down is negative when airborne).
    pub fn altitude_m(&self) -> f64 {
        -self.down_m
    }

    pub fn horizontal_distance_m(&self, other: &PositionNed) -> f64 {
        (self.north_m - other.north_m).hypot(self.east_m - other.east_m)
    }

    pub fn with_yaw(self, yaw_deg: f64) -> PositionNedYaw {
        PositionNedYaw {
            north_m: self.north_m,
            east_m: self.east_m,
            down_m: self.down_m,
            yaw_deg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityNed {
    pub north_m_s: f64,
    pub east_m_s: f64,
    pub down_m_s: f64,
}

impl VelocityNed {
    pub fn new(north_m_s: f64, east_m_s: f64, down_m_s: f64) -> Self {
        Self { north_m_s, east_m_s, down_m_s }
    }

    pub fn ground_speed_m_s(&self) -> f64 {
        self.north_m_s.hypot(self.east_m_s)
    }
}

/// Position setpoint streamed to the flight controller in continuous-setpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionNedYaw {
    pub north_m: f64,
    pub east_m: f64,
    pub down_m: f64,
    pub yaw_deg: f64,
}

impl PositionNedYaw {
    pub fn new(north_m: f64, east_m: f64, down_m: f64, yaw_deg: f64) -> Self {
        Self { north_m, east_m, down_m, yaw_deg }
    }

    /// Builds a setpoint from a positive altitude instead of a down component.
    pub fn at_altitude(north_m: f64, east_m: f64, altitude_m: f64, yaw_deg: f64) -> Self {
        Self::new(north_m, east_m, -altitude_m, yaw_deg)
    }

    pub fn position(&self) -> PositionNed {
        PositionNed::new(self.north_m, self.east_m, self.down_m)
    }

    pub fn is_finite(&self) -> bool {
        self.north_m.is_finite()
            && self.east_m.is_finite()
            && self.down_m.is_finite()
            && self.yaw_deg.is_finite()
    }
}
