//! Turns resolved commands into vehicle calls.
//!
//! Every call runs the same sequence: cancel pursuit unless the new command is
//! a follow, leave continuous-setpoint mode unless the new command keeps
//! streaming, then dispatch. Entering continuous-setpoint mode always primes the
//! autopilot with setpoints first.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use aero_fc::{LinkError, VehicleLink};
use aero_proto::{Action, ActionKind, Command, FollowParams, GotoParams, PositionNed, PositionNedYaw};

use crate::config::{ExecutorPolicy, PursuitPolicy};
use crate::error::ExecutionError;
use crate::pursuit::PursuitController;
use crate::state::StateStore;
use crate::streamer::SetpointStreamer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Grounded,
    /// Flying under the autopilot's own mode, no setpoint stream.
    Airborne,
    ModeTransitioning,
    StreamingHold,
    Pursuing,
}

pub struct Executor {
    link: Arc<dyn VehicleLink>,
    store: StateStore,
    streamer: Arc<Mutex<SetpointStreamer>>,
    pursuit: PursuitController,
    policy: ExecutorPolicy,
    offboard_active: bool,
    transitioning: bool,
    airborne: bool,
}

impl Executor {
    pub fn new(
        link: Arc<dyn VehicleLink>,
        store: StateStore,
        policy: ExecutorPolicy,
        pursuit_policy: PursuitPolicy,
    ) -> Self {
        let streamer = Arc::new(Mutex::new(SetpointStreamer::new(link.clone(), policy.stream_interval())));
        let pursuit = PursuitController::new(store.clone(), streamer.clone(), pursuit_policy);
        Self {
            link,
            store,
            streamer,
            pursuit,
            policy,
            offboard_active: false,
            transitioning: false,
            airborne: false,
        }
    }

    pub fn state(&self) -> ExecutorState {
        if self.transitioning {
            ExecutorState::ModeTransitioning
        } else if self.pursuit.is_running() {
            ExecutorState::Pursuing
        } else if self.offboard_active {
            ExecutorState::StreamingHold
        } else if self.airborne || self.store.snapshot().vehicle.in_air {
            ExecutorState::Airborne
        } else {
            ExecutorState::Grounded
        }
    }

    pub fn offboard_active(&self) -> bool {
        self.offboard_active
    }

    pub fn streamer(&self) -> Arc<Mutex<SetpointStreamer>> {
        self.streamer.clone()
    }

    pub fn pursuit(&self) -> &PursuitController {
        &self.pursuit
    }

    /// Runs `cmd`, logging any failure. Returns whether it succeeded.
    pub async fn execute(&mut self, cmd: &Command) -> bool {
        match self.try_execute(cmd).await {
            Ok(()) => {
                info!("executed {} ({})", cmd.kind(), cmd.reason());
                true
            }
            Err(e) => {
                error!("execute failed: {}", e);
                false
            }
        }
    }

    pub async fn try_execute(&mut self, cmd: &Command) -> Result<(), ExecutionError> {
        let kind = cmd.kind();
        validate(cmd)?;

        if kind != ActionKind::FollowTarget {
            self.pursuit.stop().await;
        }
        let left_offboard =
            !matches!(kind, ActionKind::GotoLocation | ActionKind::FollowTarget | ActionKind::DoNothing)
                && self.leave_offboard().await;

        match cmd.action() {
            Action::Takeoff(p) => {
                self.takeoff(p.altitude_m.unwrap_or(self.policy.default_takeoff_alt_m)).await
            }
            Action::Land => self.land(left_offboard).await,
            Action::Disarm => {
                self.link.disarm().await.map_err(|e| ExecutionError::from_link(kind, e))
            }
            Action::GotoLocation(p) => self.goto(p).await,
            Action::FollowTarget(p) => self.follow(p).await,
            Action::DoNothing => {
                self.heal_stream().await;
                Ok(())
            }
        }
    }

    /// Stops pursuit and streaming and leaves continuous-setpoint mode.
    pub async fn shutdown(&mut self) {
        self.pursuit.stop().await;
        self.leave_offboard().await;
        info!("executor: shut down");
    }

    /// Returns whether a stream or offboard mode was actually torn down.
    async fn leave_offboard(&mut self) -> bool {
        let was_streaming = {
            let mut streamer = self.streamer.lock().await;
            let running = streamer.is_running();
            streamer.stop().await;
            running
        };
        let was_offboard = self.offboard_active;
        if was_offboard {
            self.offboard_active = false;
            match self.link.exit_continuous_setpoint_mode().await {
                Ok(()) => info!("offboard: exited"),
                Err(e) => warn!("offboard: exit request failed: {}", e),
            }
        }
        was_streaming || was_offboard
    }

    async fn takeoff(&mut self, altitude_m: f64) -> Result<(), ExecutionError> {
        let kind = ActionKind::Takeoff;
        if !self.link.is_connected() {
            return Err(ExecutionError::Connection { action: kind, source: LinkError::Disconnected });
        }
        self.link.arm().await.map_err(|e| ExecutionError::from_link(kind, e))?;
        info!("takeoff: armed, climbing to {:.1} m", altitude_m);
        self.link.takeoff(altitude_m).await.map_err(|e| ExecutionError::from_link(kind, e))?;
        self.airborne = true;
        Ok(())
    }

    async fn land(&mut self, left_offboard: bool) -> Result<(), ExecutionError> {
        let kind = ActionKind::Land;
        if left_offboard {
            tokio::time::sleep(self.policy.settle()).await;
        }
        self.link.land().await.map_err(|e| ExecutionError::from_link(kind, e))?;
        self.airborne = false;
        info!("land: on the ground, disarming");
        self.link.disarm().await.map_err(|e| ExecutionError::from_link(kind, e))
    }

    async fn goto(&mut self, p: &GotoParams) -> Result<(), ExecutionError> {
        let target = PositionNedYaw::at_altitude(p.north_m, p.east_m, p.altitude_m, p.yaw_deg);
        if !self.offboard_active {
            return self.enter_offboard(ActionKind::GotoLocation, target).await;
        }
        let mut streamer = self.streamer.lock().await;
        if streamer.is_running() {
            streamer.update_in_place(target);
        } else {
            streamer.start(target).await;
        }
        info!("goto: n={:.1} e={:.1} alt={:.1}", p.north_m, p.east_m, p.altitude_m);
        Ok(())
    }

    async fn follow(&mut self, p: &FollowParams) -> Result<(), ExecutionError> {
        let st = self.store.snapshot();
        let Some(track) = st.select_track(p.target_id.as_deref(), self.pursuit.policy().track_max_age()) else {
            return Err(ExecutionError::TargetUnavailable { target_id: p.target_id.clone() });
        };
        let hold = hold_facing(st.vehicle.position, track.position);

        if !self.offboard_active {
            self.enter_offboard(ActionKind::FollowTarget, hold).await?;
        } else {
            let mut streamer = self.streamer.lock().await;
            if !streamer.is_running() {
                streamer.start(hold).await;
            }
        }
        self.pursuit.start(p.target_id.clone()).await;
        Ok(())
    }

    /// In offboard with a dead stream, restarts it holding the vehicle's last
    /// known position.
    async fn heal_stream(&mut self) {
        if !self.offboard_active {
            return;
        }
        let mut streamer = self.streamer.lock().await;
        if streamer.is_running() {
            return;
        }
        let pos = self.store.snapshot().vehicle.position;
        let hold = pos.with_yaw(streamer.current().yaw_deg);
        warn!("stream: not running in offboard, restarting at last known position");
        streamer.start(hold).await;
    }

    async fn enter_offboard(&mut self, kind: ActionKind, sp: PositionNedYaw) -> Result<(), ExecutionError> {
        self.transitioning = true;
        let res = self.prime_and_enter(kind, sp).await;
        self.transitioning = false;
        if res.is_ok() {
            self.offboard_active = true;
            info!("offboard: entered for {}", kind);
        }
        res
    }

    async fn prime_and_enter(&mut self, kind: ActionKind, sp: PositionNedYaw) -> Result<(), ExecutionError> {
        {
            let mut streamer = self.streamer.lock().await;
            streamer
                .prime(sp, self.policy.priming_count)
                .await
                .map_err(|e| ExecutionError::mode(kind, e))?;
            streamer.start(sp).await;
        }
        if let Err(e) = self.link.enter_continuous_setpoint_mode().await {
            self.streamer.lock().await.stop().await;
            return Err(ExecutionError::mode(kind, e));
        }
        Ok(())
    }
}

/// Rejects bad parameters before anything touches the vehicle.
fn validate(cmd: &Command) -> Result<(), ExecutionError> {
    let action = cmd.kind();
    let check = |param: &'static str, value: f64, positive: bool| {
        if !value.is_finite() || (positive && value <= 0.0) {
            Err(ExecutionError::InvalidParameter { action, param, value })
        } else {
            Ok(())
        }
    };
    match cmd.action() {
        Action::Takeoff(p) => {
            if let Some(alt) = p.altitude_m {
                check("altitude_m", alt, true)?;
            }
        }
        Action::GotoLocation(p) => {
            check("north_m", p.north_m, false)?;
            check("east_m", p.east_m, false)?;
            check("altitude_m", p.altitude_m, true)?;
            check("yaw_deg", p.yaw_deg, false)?;
        }
        _ => {}
    }
    Ok(())
}

fn hold_facing(at: PositionNed, target: PositionNed) -> PositionNedYaw {
    let yaw = (target.east_m - at.east_m)
        .atan2(target.north_m - at.north_m)
        .to_degrees()
        .rem_euclid(360.0);
    at.with_yaw(yaw)
}
