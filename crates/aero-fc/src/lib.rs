pub mod link;
pub mod mav;
pub mod sim;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

pub use link::{LinkError, VehicleLink};
pub use mav::MavLink;
pub use sim::{SimConfig, SimLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Mavlink,
    Sim,
}

/// Autopilot flavour; decides custom mode numbers and takeoff semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autopilot {
    #[default]
    Px4,
    Ardupilot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub kind: LinkKind,

    /// MAVLink connection string, e.g. "udpin:0.0.0.0:14540" or
    /// "serial:/dev/ttyACM0:57600". Required when kind = "mavlink".
    pub url: Option<String>,

    /// MAVLink ids we use (companion side)
    #[serde(default = "default_sys_id")]
    pub sys_id: u8,
    #[serde(default = "default_comp_id")]
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for both PX4 and ArduPilot.
    #[serde(default = "default_target")]
    pub target_sys: u8,
    #[serde(default = "default_target")]
    pub target_comp: u8,

    #[serde(default)]
    pub autopilot: Autopilot,

    /// How long connect() waits for the first autopilot heartbeat. Default 5s.
    pub heartbeat_timeout_ms: Option<u64>,

    /// COMMAND_ACK wait per COMMAND_LONG. Default 1.5s.
    pub command_ack_timeout_ms: Option<u64>,

    /// Altitude monitoring windows. Defaults 60s / 90s.
    pub takeoff_timeout_s: Option<u64>,
    pub land_timeout_s: Option<u64>,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,
}

fn default_sys_id() -> u8 {
    245
}

fn default_comp_id() -> u8 {
    191
}

fn default_target() -> u8 {
    1
}

impl LinkConfig {
    pub fn sim() -> Self {
        Self {
            kind: LinkKind::Sim,
            url: None,
            sys_id: default_sys_id(),
            comp_id: default_comp_id(),
            target_sys: default_target(),
            target_comp: default_target(),
            autopilot: Autopilot::default(),
            heartbeat_timeout_ms: None,
            command_ack_timeout_ms: None,
            takeoff_timeout_s: None,
            land_timeout_s: None,
            send_heartbeat_hz: None,
        }
    }
}

/// Builds the configured link. The caller still has to `connect()` it.
pub fn open_link(cfg: &LinkConfig) -> Result<Arc<dyn VehicleLink>> {
    match cfg.kind {
        LinkKind::Sim => Ok(Arc::new(SimLink::new(SimConfig::default()))),
        LinkKind::Mavlink => {
            let link = MavLink::open(cfg).context("open mavlink vehicle link")?;
            Ok(Arc::new(link))
        }
    }
}
