//! Kinematic stand-in for a flight controller.
//!
//! Good enough to exercise the engine end to end without SITL: it climbs, lands,
//! tracks offboard setpoints at a bounded speed and drains the battery while armed.
//! Like PX4 it refuses offboard unless setpoints have been streaming.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use aero_proto::{FlightMode, PositionNed, PositionNedYaw, VehicleSnapshot, VelocityNed};

use crate::link::{LinkError, VehicleLink};

const TICK: Duration = Duration::from_millis(100);
const SETPOINT_FRESH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub climb_rate_m_s: f64,
    pub max_speed_m_s: f64,
    pub start_battery_pct: f32,
    pub battery_drain_pct_per_min: f32,
    /// Makes every offboard entry fail, for exercising recovery paths.
    pub reject_offboard: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            climb_rate_m_s: 2.0,
            max_speed_m_s: 5.0,
            start_battery_pct: 100.0,
            battery_drain_pct_per_min: 1.0,
            reject_offboard: false,
        }
    }
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    armed: bool,
    mode: FlightMode,
    position: PositionNed,
    velocity: VelocityNed,
    climb_to: f64,
    target: Option<PositionNedYaw>,
    last_setpoint_at: Option<Instant>,
    setpoints: u64,
    battery: f32,
    last_step: Instant,
}

impl SimState {
    fn step(&mut self, cfg: &SimConfig) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f64();
        self.last_step = now;
        if dt <= 0.0 {
            return;
        }

        if self.armed {
            self.battery = (self.battery - cfg.battery_drain_pct_per_min * dt as f32 / 60.0).max(0.0);
        }

        let before = self.position;
        match self.mode {
            FlightMode::Takeoff => {
                let alt = (self.position.altitude_m() + cfg.climb_rate_m_s * dt).min(self.climb_to);
                self.position.down_m = -alt;
                if alt >= self.climb_to {
                    self.mode = FlightMode::Hold;
                }
            }
            FlightMode::Land => {
                let alt = (self.position.altitude_m() - cfg.climb_rate_m_s * dt).max(0.0);
                self.position.down_m = -alt;
                if alt <= 0.0 {
                    self.mode = FlightMode::Hold;
                }
            }
            FlightMode::Offboard => {
                if let Some(t) = self.target {
                    let dn = t.north_m - self.position.north_m;
                    let de = t.east_m - self.position.east_m;
                    let dd = t.down_m - self.position.down_m;
                    let dist = (dn * dn + de * de + dd * dd).sqrt();
                    let reach = cfg.max_speed_m_s * dt;
                    if dist <= reach {
                        self.position = t.position();
                    } else {
                        let k = reach / dist;
                        self.position.north_m += dn * k;
                        self.position.east_m += de * k;
                        self.position.down_m += dd * k;
                    }
                }
            }
            _ => {}
        }
        self.velocity = VelocityNed::new(
            (self.position.north_m - before.north_m) / dt,
            (self.position.east_m - before.east_m) / dt,
            (self.position.down_m - before.down_m) / dt,
        );
    }

    fn in_air(&self) -> bool {
        self.position.altitude_m() > 0.05
    }
}

pub struct SimLink {
    cfg: SimConfig,
    state: Mutex<SimState>,
}

impl SimLink {
    pub fn new(cfg: SimConfig) -> Self {
        let battery = cfg.start_battery_pct;
        Self {
            cfg,
            state: Mutex::new(SimState {
                connected: false,
                armed: false,
                mode: FlightMode::Hold,
                position: PositionNed::default(),
                velocity: VelocityNed::default(),
                climb_to: 0.0,
                target: None,
                last_setpoint_at: None,
                setpoints: 0,
                battery,
                last_step: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.step(&self.cfg);
        st
    }

    fn require_connected(&self) -> Result<(), LinkError> {
        if self.state().connected {
            Ok(())
        } else {
            Err(LinkError::Disconnected)
        }
    }

    /// Number of setpoints received since start.
    pub fn setpoints_received(&self) -> u64 {
        self.state().setpoints
    }

    pub fn set_battery(&self, pct: f32) {
        self.state().battery = pct;
    }

    pub fn position(&self) -> PositionNed {
        self.state().position
    }
}

#[async_trait]
impl VehicleLink for SimLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.state().connected = true;
        info!("sim: connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.require_connected()?;
        self.state().armed = true;
        info!("sim: armed");
        Ok(())
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.require_connected()?;
        let mut st = self.state();
        if st.in_air() {
            return Err(LinkError::Rejected { command: "disarm", result: "vehicle in air".into() });
        }
        st.armed = false;
        st.mode = FlightMode::Hold;
        st.target = None;
        info!("sim: disarmed");
        Ok(())
    }

    async fn takeoff(&self, altitude_m: f64) -> Result<(), LinkError> {
        self.require_connected()?;
        {
            let mut st = self.state();
            if !st.armed {
                return Err(LinkError::Rejected { command: "takeoff", result: "not armed".into() });
            }
            st.climb_to = altitude_m;
            st.mode = FlightMode::Takeoff;
        }
        let window = Duration::from_secs_f64(altitude_m / self.cfg.climb_rate_m_s * 2.0 + 5.0);
        let deadline = Instant::now() + window;
        loop {
            if self.state().position.altitude_m() >= altitude_m * 0.95 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout("takeoff altitude"));
            }
            tokio::time::sleep(TICK).await;
        }
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.require_connected()?;
        let window = {
            let mut st = self.state();
            st.mode = FlightMode::Land;
            st.target = None;
            Duration::from_secs_f64(st.position.altitude_m() / self.cfg.climb_rate_m_s * 2.0 + 5.0)
        };
        let deadline = Instant::now() + window;
        loop {
            if !self.state().in_air() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout("landing"));
            }
            tokio::time::sleep(TICK).await;
        }
    }

    async fn enter_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        self.require_connected()?;
        let mut st = self.state();
        if self.cfg.reject_offboard {
            return Err(LinkError::Rejected { command: "offboard", result: "denied".into() });
        }
        if !st.armed {
            return Err(LinkError::Rejected { command: "offboard", result: "not armed".into() });
        }
        let streaming = st.last_setpoint_at.map(|t| t.elapsed() <= SETPOINT_FRESH).unwrap_or(false);
        if !streaming {
            return Err(LinkError::Rejected { command: "offboard", result: "no setpoint stream".into() });
        }
        st.mode = FlightMode::Offboard;
        Ok(())
    }

    async fn exit_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        self.require_connected()?;
        let mut st = self.state();
        if st.mode == FlightMode::Offboard {
            st.mode = FlightMode::Hold;
        }
        Ok(())
    }

    async fn send_setpoint(&self, setpoint: PositionNedYaw) -> Result<(), LinkError> {
        self.require_connected()?;
        let mut st = self.state();
        st.target = Some(setpoint);
        st.last_setpoint_at = Some(Instant::now());
        st.setpoints += 1;
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<VehicleSnapshot, LinkError> {
        self.require_connected()?;
        let st = self.state();
        Ok(VehicleSnapshot {
            armed: st.armed,
            in_air: st.in_air(),
            flight_mode: st.mode,
            position: st.position,
            velocity: st.velocity,
            battery_percent: Some(st.battery),
            relative_altitude_m: st.position.altitude_m(),
        })
    }
}
