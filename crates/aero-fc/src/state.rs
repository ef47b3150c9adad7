use std::time::{Duration, Instant};

use mavlink::common::{MavCmd, MavLandedState, MavMessage, MavModeFlag, MavResult};

use aero_proto::{FlightMode, PositionNed, VehicleSnapshot, VelocityNed};

use crate::Autopilot;

const MAX_ACKS: usize = 16;

#[derive(Debug, Clone)]
pub struct CommandAck {
    pub command: MavCmd,
    pub result: MavResult,
    pub at: Instant,
}

/// Telemetry cache filled by the MAVLink reader task and read by `read_snapshot`.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub last_heartbeat: Option<Instant>,
    pub messages: u64,
    pub armed: bool,
    pub flight_mode: FlightMode,
    pub landed: Option<bool>,
    pub position: Option<PositionNed>,
    pub velocity: VelocityNed,
    pub relative_alt_m: Option<f64>,
    pub amsl_alt_m: Option<f64>,
    pub battery_percent: Option<f32>,
    pub acks: Vec<CommandAck>,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn ingest(&mut self, msg: &MavMessage, autopilot: Autopilot) {
        self.messages += 1;
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                self.last_heartbeat = Some(Instant::now());
                self.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.flight_mode = decode_mode(autopilot, hb.custom_mode);
            }
            MavMessage::LOCAL_POSITION_NED(p) => {
                self.position = Some(PositionNed::new(p.x as f64, p.y as f64, p.z as f64));
                self.velocity = VelocityNed::new(p.vx as f64, p.vy as f64, p.vz as f64);
            }
            MavMessage::GLOBAL_POSITION_INT(g) => {
                // millimetres
                self.relative_alt_m = Some(g.relative_alt as f64 / 1000.0);
                self.amsl_alt_m = Some(g.alt as f64 / 1000.0);
            }
            MavMessage::SYS_STATUS(s) => {
                // -1 means invalid
                if s.battery_remaining >= 0 && s.battery_remaining <= 100 {
                    self.battery_percent = Some(s.battery_remaining as f32);
                }
            }
            MavMessage::EXTENDED_SYS_STATE(s) => {
                self.landed = match s.landed_state {
                    MavLandedState::MAV_LANDED_STATE_ON_GROUND => Some(true),
                    MavLandedState::MAV_LANDED_STATE_IN_AIR
                    | MavLandedState::MAV_LANDED_STATE_TAKEOFF
                    | MavLandedState::MAV_LANDED_STATE_LANDING => Some(false),
                    _ => None,
                };
            }
            MavMessage::COMMAND_ACK(ack) => {
                if self.acks.len() >= MAX_ACKS {
                    self.acks.remove(0);
                }
                self.acks.push(CommandAck { command: ack.command, result: ack.result, at: Instant::now() });
            }
            _ => {}
        }
    }

    /// Latest ack for `command` received after `since`.
    pub fn ack_since(&self, command: MavCmd, since: Instant) -> Option<MavResult> {
        self.acks
            .iter()
            .rev()
            .find(|a| a.command == command && a.at >= since)
            .map(|a| a.result)
    }

    pub fn in_air(&self) -> bool {
        match self.landed {
            Some(landed) => !landed,
            None => self.armed && self.relative_alt_m.map(|a| a > 0.3).unwrap_or(false),
        }
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        let position = self.position.unwrap_or_default();
        VehicleSnapshot {
            armed: self.armed,
            in_air: self.in_air(),
            flight_mode: self.flight_mode,
            position,
            velocity: self.velocity,
            battery_percent: self.battery_percent,
            relative_altitude_m: self.relative_alt_m.unwrap_or_else(|| position.altitude_m()),
        }
    }
}

pub fn decode_mode(autopilot: Autopilot, custom_mode: u32) -> FlightMode {
    match autopilot {
        Autopilot::Px4 => {
            let main = (custom_mode >> 16) & 0xff;
            let sub = (custom_mode >> 24) & 0xff;
            match (main, sub) {
                (1, _) | (2, _) | (5, _) | (7, _) => FlightMode::Manual,
                (3, _) => FlightMode::Hold,
                (4, 2) => FlightMode::Takeoff,
                (4, 3) => FlightMode::Hold,
                (4, 4) => FlightMode::Mission,
                (4, 5) => FlightMode::ReturnToLaunch,
                (4, 6) => FlightMode::Land,
                (6, _) => FlightMode::Offboard,
                _ => FlightMode::Other,
            }
        }
        Autopilot::Ardupilot => match custom_mode {
            0 | 2 => FlightMode::Manual,
            3 => FlightMode::Mission,
            4 => FlightMode::Offboard,
            5 | 16 | 17 => FlightMode::Hold,
            6 | 21 => FlightMode::ReturnToLaunch,
            9 => FlightMode::Land,
            _ => FlightMode::Other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn px4_modes() {
        assert_eq!(decode_mode(Autopilot::Px4, 6 << 16), FlightMode::Offboard);
        assert_eq!(decode_mode(Autopilot::Px4, (4 << 16) | (3 << 24)), FlightMode::Hold);
        assert_eq!(decode_mode(Autopilot::Px4, (4 << 16) | (6 << 24)), FlightMode::Land);
        assert_eq!(decode_mode(Autopilot::Px4, 0), FlightMode::Other);
    }

    #[test]
    fn ardupilot_modes() {
        assert_eq!(decode_mode(Autopilot::Ardupilot, 4), FlightMode::Offboard);
        assert_eq!(decode_mode(Autopilot::Ardupilot, 9), FlightMode::Land);
        assert_eq!(decode_mode(Autopilot::Ardupilot, 5), FlightMode::Hold);
    }

    #[test]
    fn in_air_falls_back_to_altitude() {
        let mut st = LinkStatus::default();
        assert!(!st.in_air());
        st.armed = true;
        st.relative_alt_m = Some(2.0);
        assert!(st.in_air());
        st.landed = Some(true);
        assert!(!st.in_air());
    }
}
