pub mod command;
pub mod geometry;
pub mod telemetry;

pub use command::{parse_reply, Action, ActionKind, Command, CommandError, FollowParams, GotoParams, TakeoffParams, WireCommand};
pub use geometry::{PositionNed, PositionNedYaw, VelocityNed};
pub use telemetry::{FlightMode, VehicleSnapshot};
