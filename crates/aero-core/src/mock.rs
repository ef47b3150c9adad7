//! Recording vehicle link for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use aero_fc::{LinkError, VehicleLink};
use aero_proto::{FlightMode, PositionNed, PositionNedYaw, VehicleSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Arm,
    Disarm,
    Takeoff(f64),
    Land,
    EnterOffboard,
    ExitOffboard,
    Setpoint(PositionNedYaw),
}

pub struct MockLink {
    calls: Mutex<Vec<Call>>,
    snapshot: Mutex<VehicleSnapshot>,
    connected: AtomicBool,
    failing: Mutex<HashSet<&'static str>>,
}

impl MockLink {
    /// Connected, armed and hovering at 10 m over the origin.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            snapshot: Mutex::new(VehicleSnapshot {
                armed: true,
                in_air: true,
                flight_mode: FlightMode::Hold,
                position: PositionNed::new(0.0, 0.0, -10.0),
                relative_altitude_m: 10.0,
                battery_percent: Some(80.0),
                ..Default::default()
            }),
            connected: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
        })
    }

    /// Makes `op` ("arm", "takeoff", "land", "disarm", "enter", "exit", "setpoint") fail.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_snapshot(&self, snapshot: VehicleSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn setpoints(&self) -> Vec<PositionNedYaw> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Setpoint(sp) => Some(sp),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, op: &'static str, call: Call) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(op) {
            return Err(LinkError::Rejected { command: op, result: "mock failure".into() });
        }
        Ok(())
    }
}

#[async_trait]
impl VehicleLink for MockLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.connected.store(true, Ordering::SeqCst);
        self.record("connect", Call::Connect)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.record("arm", Call::Arm)
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.record("disarm", Call::Disarm)
    }

    async fn takeoff(&self, altitude_m: f64) -> Result<(), LinkError> {
        self.record("takeoff", Call::Takeoff(altitude_m))
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.record("land", Call::Land)
    }

    async fn enter_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        self.record("enter", Call::EnterOffboard)
    }

    async fn exit_continuous_setpoint_mode(&self) -> Result<(), LinkError> {
        self.record("exit", Call::ExitOffboard)
    }

    async fn send_setpoint(&self, setpoint: PositionNedYaw) -> Result<(), LinkError> {
        self.record("setpoint", Call::Setpoint(setpoint))
    }

    async fn read_snapshot(&self) -> Result<VehicleSnapshot, LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }
}
