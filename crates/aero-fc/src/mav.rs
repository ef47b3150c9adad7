use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavResult, MavState, MavType,
        PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    MavConnection, MavHeader,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use aero_proto::{PositionNedYaw, VehicleSnapshot};

use crate::link::{LinkError, VehicleLink};
use crate::state::LinkStatus;
use crate::{Autopilot, LinkConfig};

// Position only: ignore velocity, acceleration and yaw rate.
const POSITION_YAW_MASK: u16 = 0x09f8;

const HEARTBEAT_STALE: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(50);

const MSG_LOCAL_POSITION_NED: f32 = 32.0;
const MSG_GLOBAL_POSITION_INT: f32 = 33.0;
const MSG_SYS_STATUS: f32 = 1.0;
const MSG_EXTENDED_SYS_STATE: f32 = 245.0;

struct Wire {
    conn: Box<dyn MavConnection<MavMessage> + Send + Sync>,
    sys_id: u8,
    comp_id: u8,
    sequence: AtomicU8,
}

impl Wire {
    fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.conn
            .send(&hdr, msg)
            .map_err(|e| LinkError::Protocol(format!("mavlink send: {}", e)))?;
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), LinkError> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(&MavMessage::HEARTBEAT(hb))
    }
}

/// MAVLink implementation of [`VehicleLink`] for PX4 and ArduPilot.
///
/// A blocking reader task feeds [`LinkStatus`]; every trait call reads that cache
/// or sends a single message and polls the cache for the acknowledgement.
pub struct MavLink {
    wire: Arc<Wire>,
    status: Arc<Mutex<LinkStatus>>,
    closed: Arc<AtomicBool>,
    reader_started: AtomicBool,
    target_sys: u8,
    target_comp: u8,
    autopilot: Autopilot,
    heartbeat_timeout: Duration,
    ack_timeout: Duration,
    takeoff_timeout: Duration,
    land_timeout: Duration,
    heartbeat_interval: Duration,
    boot: Instant,
}

impl MavLink {
    pub fn open(cfg: &LinkConfig) -> Result<Self> {
        let url = cfg.url.clone().context("link.url missing (kind=mavlink)")?;

        // quick validate device so a missing port fails here, not in the reader
        if let Some(rest) = url.strip_prefix("serial:") {
            let (dev, baud) = rest.rsplit_once(':').context("serial url must be serial:<dev>:<baud>")?;
            let baud: u32 = baud.parse().with_context(|| format!("invalid baud in {}", url))?;
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let conn = mavlink::connect::<MavMessage>(&url).with_context(|| format!("mavlink connect {}", url))?;
        let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);

        Ok(Self {
            wire: Arc::new(Wire {
                conn,
                sys_id: cfg.sys_id,
                comp_id: cfg.comp_id,
                sequence: AtomicU8::new(0),
            }),
            status: Arc::new(Mutex::new(LinkStatus::default())),
            closed: Arc::new(AtomicBool::new(false)),
            reader_started: AtomicBool::new(false),
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            autopilot: cfg.autopilot,
            heartbeat_timeout: Duration::from_millis(cfg.heartbeat_timeout_ms.unwrap_or(5_000)),
            ack_timeout: Duration::from_millis(cfg.command_ack_timeout_ms.unwrap_or(1_500)),
            takeoff_timeout: Duration::from_secs(cfg.takeoff_timeout_s.unwrap_or(60)),
            land_timeout: Duration::from_secs(cfg.land_timeout_s.unwrap_or(90)),
            heartbeat_interval: Duration::from_secs_f32(1.0 / hb_hz),
            boot: Instant::now(),
        })
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link_status(&self) -> LinkStatus {
        self.status().clone()
    }

    fn spawn_reader(&self) {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let wire = self.wire.clone();
        let status = self.status.clone();
        let closed = self.closed.clone();
        let autopilot = self.autopilot;
        let hb_interval = self.heartbeat_interval;

        // mavlink recv blocks, so the reader lives on the blocking pool.
        tokio::task::spawn_blocking(move || {
            let mut last_hb_send: Option<Instant> = None;
            while !closed.load(Ordering::Relaxed) {
                if last_hb_send.map(|t| t.elapsed() >= hb_interval).unwrap_or(true) {
                    if let Err(e) = wire.send_heartbeat() {
                        debug!("companion heartbeat failed: {}", e);
                    }
                    last_hb_send = Some(Instant::now());
                }
                match wire.conn.recv() {
                    Ok((_hdr, msg)) => {
                        status.lock().unwrap_or_else(PoisonError::into_inner).ingest(&msg, autopilot);
                    }
                    Err(e) => {
                        debug!("mavlink recv: {}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            info!("mavlink reader stopped");
        });
    }

    fn require_heartbeat(&self) -> Result<(), LinkError> {
        match self.status().hb_age() {
            Some(age) if age < HEARTBEAT_STALE => Ok(()),
            _ => Err(LinkError::Disconnected),
        }
    }

    fn command_long(&self, command: MavCmd, params: [f32; 7]) -> COMMAND_LONG_DATA {
        COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command: command.into(),
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        }
    }

    /// Sends a COMMAND_LONG and waits for its COMMAND_ACK.
    async fn command(&self, name: &'static str, command: MavCmd, params: [f32; 7]) -> Result<(), LinkError> {
        self.require_heartbeat()?;
        let sent_at = Instant::now();
        debug!("FC: sending {}", name);
        self.wire.send(&MavMessage::COMMAND_LONG(self.command_long(command, params)))?;

        let deadline = sent_at + self.ack_timeout;
        while Instant::now() < deadline {
            let ack = self.status().ack_since(command, sent_at);
            match ack {
                Some(MavResult::MAV_RESULT_ACCEPTED) => return Ok(()),
                Some(MavResult::MAV_RESULT_IN_PROGRESS) | None => {}
                Some(other) => {
                    return Err(LinkError::Rejected { command: name, result: format!("{:?}", other) });
                }
            }
            tokio::time::sleep(POLL).await;
        }
        Err(LinkError::Timeout("command ack"))
    }

    async fn set_mode(&self, name: &'static str, main: f32, sub: f32) -> Result<(), LinkError> {
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command(name, MavCmd::MAV_CMD_DO_SET_MODE, [custom, main, sub, 0.0, 0.0, 0.0, 0.0]).await
    }

    /// Best effort: ask for the telemetry the snapshot is built from.
    fn request_streams(&self) {
        for (msg_id, hz) in [
            (MSG_LOCAL_POSITION_NED, 10.0_f32),
            (MSG_GLOBAL_POSITION_INT, 5.0),
            (MSG_SYS_STATUS, 1.0),
            (MSG_EXTENDED_SYS_STATE, 2.0),
        ] {
            let interval_us = 1_000_000.0 / hz;
            let cmd = self.command_long(
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                [msg_id, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0],
            );
            if let Err(e) = self.wire.send(&MavMessage::COMMAND_LONG(cmd)) {
                warn!("request message {} failed: {}", msg_id, e);
            }
        }
    }

    async fn wait_for<F>(&self, what: &'static str, timeout: Duration, mut done: F) -> Result<(), LinkError>
    where
        F: FnMut(&LinkStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let st = self.status();
                if done(&st) {
                    return Ok(());
                }
                debug!("{}: alt={:?} in_air={}", what, st.relative_alt_m, st.in_air());
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout(what));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

impl Drop for MavLink {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl VehicleLink for MavLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.spawn_reader();
        let deadline = Instant::now() + self.heartbeat_timeout;
        while Instant::now() < deadline {
            if self.require_heartbeat().is_ok() {
                info!("FC: heartbeat seen, link up");
                self.request_streams();
                return Ok(());
            }
            tokio::time::sleep(POLL).await;
        }
        Err(LinkError::Timeout("autopilot heartbeat"))
    }

    fn is_connected(&self) -> bool {
        self.require_heartbeat().is_ok()
    }

    async fn arm(&self) -> Result<(), LinkError> {
        if self.status().armed {
            info!("FC: already armed");
            return Ok(());
        }
        info!("FC: arming");
        self.command("arm", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        if !self.status().armed {
            info!("FC: already disarmed");
            return Ok(());
        }
        info!("FC: disarming");
        self.command("disarm", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7]).await
    }

    async fn takeoff(&self, altitude_m: f64) -> Result<(), LinkError> {
        info!("FC: takeoff to {:.1}m", altitude_m);
        match self.autopilot {
            Autopilot::Px4 => {
                // PX4 wants an AMSL altitude in param7.
                let (amsl, rel) = {
                    let st = self.status();
                    (st.amsl_alt_m, st.relative_alt_m)
                };
                let (Some(amsl), Some(rel)) = (amsl, rel) else {
                    return Err(LinkError::Protocol("no global position for takeoff".into()));
                };
                let target = (amsl - rel + altitude_m) as f32;
                self.command(
                    "takeoff",
                    MavCmd::MAV_CMD_NAV_TAKEOFF,
                    [-1.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, target],
                )
                .await?;
            }
            Autopilot::Ardupilot => {
                self.set_mode("guided", 4.0, 0.0).await?;
                self.command(
                    "takeoff",
                    MavCmd::MAV_CMD_NAV_TAKEOFF,
                    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m as f32],
                )
                .await?;
            }
        }

        let goal = altitude_m * 0.95;
        self.wait_for("takeoff altitude", self.takeoff_timeout, |st| {
            st.relative_alt_m.map(|a| a >= goal).unwrap_or(false)
        })
        .await?;
        info!("FC: reached takeoff altitude");
        Ok(())
    }

    async fn land(&self) -> Result<(), LinkError> {
        info!("FC: landing");
        let params = match self.autopilot {
            Autopilot::Px4 => [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
            Autopilot::Ardupilot => [0.0; 7],
        };
        self.command("land", MavCmd::MAV_CMD_NAV_LAND, params).await?;
        self.wait_for("landing", self.land_timeout, |st| {
            !st.in_air() || st.relative_alt_m.map(|a| a < 0.5).unwrap_or(false)
        })
        .await?;
        info!("FC: landed");
        Ok(())
    }

    async fn enter_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        info!("FC: entering offboard");
        match self.autopilot {
            Autopilot::Px4 => self.set_mode("offboard", 6.0, 0.0).await,
            Autopilot::Ardupilot => self.set_mode("guided", 4.0, 0.0).await,
        }
    }

    async fn exit_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        info!("FC: leaving offboard for hold");
        match self.autopilot {
            Autopilot::Px4 => self.set_mode("hold", 4.0, 3.0).await,
            Autopilot::Ardupilot => self.set_mode("loiter", 5.0, 0.0).await,
        }
    }

    async fn send_setpoint(&self, setpoint: PositionNedYaw) -> Result<(), LinkError> {
        self.require_heartbeat()?;
        let msg = SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.boot.elapsed().as_millis() as u32,
            target_system: self.target_sys,
            target_component: self.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_YAW_MASK),
            x: setpoint.north_m as f32,
            y: setpoint.east_m as f32,
            z: setpoint.down_m as f32,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: (setpoint.yaw_deg as f32).to_radians(),
            yaw_rate: 0.0,
        };
        self.wire.send(&MavMessage::SET_POSITION_TARGET_LOCAL_NED(msg))
    }

    async fn read_snapshot(&self) -> Result<VehicleSnapshot, LinkError> {
        let st = self.status();
        if st.last_heartbeat.is_none() {
            return Err(LinkError::Disconnected);
        }
        Ok(st.snapshot())
    }
}
