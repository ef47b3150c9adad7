//! The control cycle: operator input, world refresh, autonomous decision,
//! arbitration, execution and safety escalation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use aero_fc::VehicleLink;
use aero_proto::{ActionKind, Command};

use crate::arbitrator::Arbitrator;
use crate::config::ControlPolicy;
use crate::decision::DecisionSource;
use crate::executor::{Executor, ExecutorState};
use crate::input::HumanInput;
use crate::perception::TrackSource;
use crate::state::StateStore;

pub struct ControlLoop {
    link: Arc<dyn VehicleLink>,
    store: StateStore,
    executor: Executor,
    arbitrator: Arbitrator,
    decision: Box<dyn DecisionSource>,
    tracks: Box<dyn TrackSource>,
    inputs: mpsc::Receiver<HumanInput>,
    inputs_open: bool,
    policy: ControlPolicy,
    track_max_age: Duration,

    /// Operator has released and the autonomous source may propose.
    autonomy_enabled: bool,
    auto_following: bool,
    /// Standing autonomous proposal, re-arbitrated every cycle.
    proposal: Command,
    /// Last command handed to the executor successfully.
    dispatched: Option<Command>,
    failures: u32,
    decision_countdown: u32,
    link_ok: bool,
}

impl ControlLoop {
    pub fn new(
        link: Arc<dyn VehicleLink>,
        store: StateStore,
        executor: Executor,
        decision: Box<dyn DecisionSource>,
        tracks: Box<dyn TrackSource>,
        inputs: mpsc::Receiver<HumanInput>,
        policy: ControlPolicy,
    ) -> Self {
        store.set_mission_objective(policy.mission_objective.clone());
        store.set_human_control_active(true);
        let track_max_age = executor.pursuit().policy().track_max_age();
        Self {
            link,
            store,
            executor,
            arbitrator: Arbitrator::new(),
            decision,
            tracks,
            inputs,
            inputs_open: true,
            policy,
            track_max_age,
            autonomy_enabled: false,
            auto_following: false,
            proposal: Command::do_nothing("System startup, awaiting operator."),
            dispatched: None,
            failures: 0,
            decision_countdown: 0,
            link_ok: true,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    /// Cycles until the operator asks to exit, then stops all background work.
    pub async fn run(mut self) {
        info!("control: started, human control active");
        while self.step().await {
            tokio::time::sleep(self.policy.cycle()).await;
        }
        info!("control: exit requested, shutting down");
        self.executor.shutdown().await;
    }

    /// One control cycle. Returns false once the operator asked to exit.
    pub async fn step(&mut self) -> bool {
        if !self.drain_inputs() {
            return false;
        }
        self.refresh().await;
        self.decide().await;
        self.dispatch().await;
        self.escalate().await;
        true
    }

    fn drain_inputs(&mut self) -> bool {
        loop {
            match self.inputs.try_recv() {
                Ok(input) => {
                    if !self.handle_input(input) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    if self.inputs_open {
                        info!("control: operator input closed");
                        self.inputs_open = false;
                    }
                    return true;
                }
            }
        }
    }

    fn handle_input(&mut self, input: HumanInput) -> bool {
        match input {
            HumanInput::Command(cmd) => {
                self.take_authority();
                self.arbitrator.set_human_command(cmd);
            }
            HumanInput::Release => {
                self.arbitrator.release();
                self.store.set_human_control_active(false);
                self.autonomy_enabled = true;
                self.dispatched = None;
                self.decision_countdown = 0;
                info!("control: released, autonomous source consulted on trigger");
            }
            HumanInput::StopFollow => {
                self.take_authority();
                self.arbitrator.set_human_command(Command::do_nothing("Human stopped follow."));
                info!("control: autonomous follow stopped by operator");
            }
            HumanInput::SimulateTarget => {
                let at = self.store.snapshot().vehicle.position;
                if !self.tracks.inject_synthetic(at) {
                    warn!("control: track source does not accept synthetic targets");
                }
            }
            HumanInput::ClearTargets => self.tracks.clear_synthetic(),
            HumanInput::Exit => return false,
        }
        true
    }

    /// Operator takes authority back; autonomy pauses until the next release.
    fn take_authority(&mut self) {
        self.arbitrator.set_human_control_active(true);
        self.store.set_human_control_active(true);
        self.autonomy_enabled = false;
        self.auto_following = false;
        self.proposal = Command::do_nothing("Autonomy paused, operator in control.");
    }

    async fn refresh(&mut self) {
        match self.link.read_snapshot().await {
            Ok(snapshot) => {
                if !self.link_ok {
                    info!("control: telemetry restored");
                    self.link_ok = true;
                }
                self.store.update_vehicle_snapshot(snapshot);
            }
            Err(e) => {
                if self.link_ok {
                    warn!("control: telemetry unavailable: {}", e);
                    self.link_ok = false;
                }
            }
        }
        self.store.update_tracks(self.tracks.tracks());
    }

    async fn decide(&mut self) {
        if !self.autonomy_enabled || self.arbitrator.human_control_active() {
            return;
        }
        if self.decision_countdown > 0 {
            self.decision_countdown -= 1;
            return;
        }
        self.decision_countdown = self.policy.decision_every.saturating_sub(1);

        let st = self.store.snapshot();
        let trigger = st.fresh_tracks(self.track_max_age).next().is_some();
        if !trigger && !self.auto_following {
            debug!("decision: no trigger, holding");
            self.proposal = Command::do_nothing("No active trigger, holding position.");
            return;
        }

        let cmd = self.decision.propose(&st).await;
        info!("decision: proposed {} ({})", cmd.kind(), cmd.reason());
        match cmd.kind() {
            ActionKind::FollowTarget => self.auto_following = true,
            ActionKind::DoNothing if self.auto_following => {
                info!("decision: hold while following, treating target as lost");
                self.auto_following = false;
            }
            _ => {}
        }
        self.proposal = cmd;
    }

    async fn dispatch(&mut self) {
        let human_active = self.arbitrator.human_control_active();
        let from_human = self.arbitrator.has_pending();
        let cmd = self.arbitrator.arbitrate(self.proposal.clone());

        if human_active && !from_human {
            // Idle hold: only keep an existing hold stream alive.
            if self.executor.state() == ExecutorState::StreamingHold {
                self.executor.execute(&cmd).await;
            }
            return;
        }
        if !from_human && cmd.kind() != ActionKind::DoNothing && self.dispatched.as_ref() == Some(&cmd) {
            return;
        }

        let kind = cmd.kind();
        if self.executor.execute(&cmd).await {
            self.failures = 0;
            if self.store.snapshot().last_executed_command.as_ref() != Some(&cmd) {
                self.store.set_last_executed_command(cmd.clone());
            }
            self.dispatched = Some(cmd);
        } else {
            self.failures += 1;
            self.dispatched = None;
            warn!("control: {} failed ({} in a row)", kind, self.failures);
            if !from_human {
                self.auto_following = false;
                self.proposal = Command::do_nothing("Previous proposal failed, holding.");
            }
        }

        if !from_human && matches!(kind, ActionKind::Takeoff | ActionKind::Land | ActionKind::Disarm) {
            self.proposal = Command::do_nothing("One-shot proposal done.");
            if kind != ActionKind::Takeoff {
                info!("control: autonomous source finished with {}, operator back in control", kind);
                self.take_authority();
            }
        }
    }

    async fn escalate(&mut self) {
        let vehicle = self.store.snapshot().vehicle;
        if vehicle.in_air && vehicle.battery_below(self.policy.critical_battery_pct) {
            warn!(
                "control: battery critical ({:.0}%), forcing land",
                vehicle.battery_percent.unwrap_or_default()
            );
            self.force_land("Emergency: critical battery.").await;
        } else if self.failures >= self.policy.max_consecutive_failures {
            error!("control: {} failed executions in a row, forcing land", self.failures);
            self.force_land("Emergency: repeated execution failures.").await;
        }
    }

    async fn force_land(&mut self, reason: &str) {
        self.take_authority();
        self.failures = 0;
        self.dispatched = None;
        let cmd = Command::land(reason);
        if self.executor.execute(&cmd).await {
            self.store.set_last_executed_command(cmd);
        }
        if let Ok(snapshot) = self.link.read_snapshot().await {
            self.store.update_vehicle_snapshot(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorPolicy, PursuitPolicy};
    use crate::decision::FollowFirstTarget;
    use crate::mock::{Call, MockLink};
    use crate::perception::ManualTargets;
    use aero_fc::{SimConfig, SimLink};
    use aero_proto::VehicleSnapshot;

    fn control_loop(link: Arc<dyn VehicleLink>, targets: ManualTargets) -> (mpsc::Sender<HumanInput>, ControlLoop) {
        let store = StateStore::new();
        let executor = Executor::new(link.clone(), store.clone(), ExecutorPolicy::default(), PursuitPolicy::default());
        let (tx, rx) = mpsc::channel(16);
        let decision = Box::new(FollowFirstTarget::new(PursuitPolicy::default().track_max_age()));
        let lp = ControlLoop::new(link, store, executor, decision, Box::new(targets), rx, ControlPolicy::default());
        (tx, lp)
    }

    #[tokio::test(start_paused = true)]
    async fn human_command_runs_once() {
        let link = MockLink::new();
        let (tx, mut lp) = control_loop(link.clone(), ManualTargets::new());
        tx.send(HumanInput::Command(Command::land("operator"))).await.unwrap();

        assert!(lp.step().await);
        assert_eq!(link.count(&Call::Land), 1);
        assert_eq!(link.count(&Call::Disarm), 1);
        assert_eq!(lp.store().snapshot().last_executed_command, Some(Command::land("operator")));

        for _ in 0..5 {
            assert!(lp.step().await);
        }
        assert_eq!(link.count(&Call::Land), 1);
        assert!(lp.arbitrator().human_control_active());
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_target_follows_until_stopped() {
        let link = MockLink::new();
        let targets = ManualTargets::new();
        let (tx, mut lp) = control_loop(link.clone(), targets.clone());

        // no trigger: released but nothing to follow
        tx.send(HumanInput::Release).await.unwrap();
        assert!(lp.step().await);
        assert!(!lp.executor().pursuit().is_running());

        tx.send(HumanInput::SimulateTarget).await.unwrap();
        tx.send(HumanInput::Release).await.unwrap();
        assert!(lp.step().await);
        assert_eq!(lp.executor().state(), ExecutorState::Pursuing);
        assert!(lp.store().snapshot().autonomous_following_active);
        assert_eq!(lp.executor().pursuit().requested_target(), Some("person-1"));

        for _ in 0..10 {
            assert!(lp.step().await);
        }
        assert_eq!(lp.executor().pursuit().spawned_tasks(), 1);
        assert_eq!(link.count(&Call::EnterOffboard), 1);

        tx.send(HumanInput::StopFollow).await.unwrap();
        assert!(lp.step().await);
        assert!(!lp.executor().pursuit().is_running());
        assert!(lp.arbitrator().human_control_active());
        assert!(lp.store().snapshot().human_control_active);
        assert!(!lp.store().snapshot().autonomous_following_active);
        assert_eq!(lp.executor().state(), ExecutorState::StreamingHold);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_battery_forces_land_and_restores_operator() {
        let link = MockLink::new();
        let (tx, mut lp) = control_loop(link.clone(), ManualTargets::new());
        tx.send(HumanInput::Release).await.unwrap();
        link.set_snapshot(VehicleSnapshot { in_air: true, battery_percent: Some(12.0), ..Default::default() });

        assert!(lp.step().await);
        assert_eq!(link.count(&Call::Land), 1);
        assert!(lp.arbitrator().human_control_active());
        assert_eq!(lp.store().snapshot().last_executed_command.map(|c| c.kind()), Some(ActionKind::Land));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_force_land() {
        let link = MockLink::new();
        let (tx, mut lp) = control_loop(link.clone(), ManualTargets::new());
        link.fail("arm");
        for i in 0..3 {
            tx.send(HumanInput::Command(Command::takeoff(Some(5.0), "up"))).await.unwrap();
            assert!(lp.step().await);
            assert_eq!(link.count(&Call::Land), if i < 2 { 0 } else { 1 });
        }
        assert_eq!(lp.store().snapshot().last_executed_command.map(|c| c.kind()), Some(ActionKind::Land));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_stops_but_closed_input_does_not() {
        let link = MockLink::new();
        let (tx, mut lp) = control_loop(link.clone(), ManualTargets::new());
        tx.send(HumanInput::Exit).await.unwrap();
        assert!(!lp.step().await);

        let (tx, mut lp) = control_loop(link, ManualTargets::new());
        drop(tx);
        assert!(lp.step().await);
        assert!(lp.step().await);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_battery_lands_simulated_vehicle() {
        let sim = Arc::new(SimLink::new(SimConfig::default()));
        sim.connect().await.unwrap();
        let (tx, mut lp) = control_loop(sim.clone(), ManualTargets::new());

        tx.send("takeoff 6".parse().unwrap()).await.unwrap();
        assert!(lp.step().await);
        assert!(sim.read_snapshot().await.unwrap().in_air);
        tx.send(HumanInput::Release).await.unwrap();
        assert!(lp.step().await);

        sim.set_battery(10.0);
        assert!(lp.step().await);
        let snap = sim.read_snapshot().await.unwrap();
        assert!(!snap.in_air);
        assert!(!snap.armed);
        assert!(lp.arbitrator().human_control_active());
        assert_eq!(lp.executor().state(), ExecutorState::Grounded);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_offboard_in_simulation_leaves_no_stream() {
        let sim = Arc::new(SimLink::new(SimConfig { reject_offboard: true, ..Default::default() }));
        sim.connect().await.unwrap();
        let (tx, mut lp) = control_loop(sim.clone(), ManualTargets::new());

        tx.send("takeoff 5".parse().unwrap()).await.unwrap();
        assert!(lp.step().await);
        tx.send("goto 10 0 5".parse().unwrap()).await.unwrap();
        assert!(lp.step().await);

        assert!(!lp.executor().offboard_active());
        assert!(!lp.executor().streamer().lock().await.is_running());
        let sent = sim.setpoints_received();
        assert!(sent >= ExecutorPolicy::default().priming_count as u64);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sim.setpoints_received(), sent);
        assert_eq!(sim.read_snapshot().await.unwrap().flight_mode, aero_proto::FlightMode::Hold);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_synthetic_target_in_simulation() {
        let sim = Arc::new(SimLink::new(SimConfig::default()));
        sim.connect().await.unwrap();
        let targets = ManualTargets::new();
        let (tx, mut lp) = control_loop(sim.clone(), targets.clone());

        tx.send("takeoff 10".parse().unwrap()).await.unwrap();
        assert!(lp.step().await);
        assert!(sim.position().altitude_m() >= 9.5);

        tx.send(HumanInput::SimulateTarget).await.unwrap();
        tx.send(HumanInput::Release).await.unwrap();
        for _ in 0..150 {
            assert!(lp.step().await);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let target = targets.tracks().remove(0);
        let gap = sim.position().horizontal_distance_m(&target.position);
        assert!((2.0..8.0).contains(&gap), "gap {:.1} m", gap);
        assert_eq!(lp.executor().state(), ExecutorState::Pursuing);

        tx.send(HumanInput::Exit).await.unwrap();
        lp.run().await;
        assert_eq!(sim.read_snapshot().await.unwrap().flight_mode, aero_proto::FlightMode::Hold);
    }
}
