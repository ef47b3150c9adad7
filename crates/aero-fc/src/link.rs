use async_trait::async_trait;

use aero_proto::{PositionNedYaw, VehicleSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("vehicle link not connected")]
    Disconnected,

    #[error("{command} rejected by autopilot: {result}")]
    Rejected { command: &'static str, result: String },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Boundary to the flight-control firmware.
///
/// Implementations are shared between the control loop and the setpoint stream
/// task, so every method takes `&self`.
#[async_trait]
pub trait VehicleLink: Send + Sync {
    async fn connect(&self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    async fn arm(&self) -> Result<(), LinkError>;

    async fn disarm(&self) -> Result<(), LinkError>;

    /// Climbs to `altitude_m` above home; returns once the altitude is reached.
    async fn takeoff(&self, altitude_m: f64) -> Result<(), LinkError>;

    /// Lands in place; returns once the vehicle is on the ground.
    async fn land(&self) -> Result<(), LinkError>;

    async fn enter_continuous_setpoint_mode(&self) -> Result<(), LinkError>;

    async fn exit_continuous_setpoint_mode(&self) -> Result<(), LinkError>;

    async fn send_setpoint(&self, setpoint: PositionNedYaw) -> Result<(), LinkError>;

    /// Latest known telemetry. Never waits for a fresh message.
    async fn read_snapshot(&self) -> Result<VehicleSnapshot, LinkError>;
}
