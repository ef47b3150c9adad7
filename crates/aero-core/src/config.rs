use std::time::Duration;

use serde::Deserialize;

/// Mode-transition and streaming constants used by the executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorPolicy {
    /// Setpoint stream cadence. 100 ms is the 10 Hz both autopilots expect.
    pub stream_interval_ms: u64,
    /// Setpoints sent before requesting offboard.
    pub priming_count: u32,
    /// Pause after leaving offboard before a land command.
    pub settle_ms: u64,
    pub default_takeoff_alt_m: f64,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            stream_interval_ms: 100,
            priming_count: 10,
            settle_ms: 500,
            default_takeoff_alt_m: 2.5,
        }
    }
}

impl ExecutorPolicy {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PursuitPolicy {
    pub interval_ms: u64,
    /// Horizontal distance kept behind the target.
    pub standoff_m: f64,
    /// Altitude above origin while following.
    pub altitude_m: f64,
    /// Beyond this horizontal error the stream is restarted on the new target,
    /// below it the setpoint is nudged in place.
    pub reposition_threshold_m: f64,
    /// Tracks not observed for this long are treated as gone.
    pub track_max_age_ms: u64,
}

impl Default for PursuitPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            standoff_m: 5.0,
            altitude_m: 10.0,
            reposition_threshold_m: 3.0,
            track_max_age_ms: 2_000,
        }
    }
}

impl PursuitPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn track_max_age(&self) -> Duration {
        Duration::from_millis(self.track_max_age_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlPolicy {
    pub cycle_ms: u64,
    /// Decision source is consulted every N control cycles.
    pub decision_every: u32,
    pub critical_battery_pct: f32,
    /// Failed executions in a row before a forced land.
    pub max_consecutive_failures: u32,
    pub mission_objective: String,
}

impl Default for ControlPolicy {
    fn default() -> Self {
        Self {
            cycle_ms: 100,
            decision_every: 50,
            critical_battery_pct: 20.0,
            max_consecutive_failures: 3,
            mission_objective: "Human-guided surveillance; follow a detected target when released.".into(),
        }
    }
}

impl ControlPolicy {
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }
}
