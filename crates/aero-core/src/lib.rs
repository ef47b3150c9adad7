//! Hybrid-authority flight control engine.
//!
//! An operator and an autonomous decision source compete for the vehicle; the
//! [`Arbitrator`] picks one command per cycle, the [`Executor`] turns it into
//! mode transitions and a continuous setpoint stream, and the pursuit loop keeps
//! re-targeting that stream while following a track.

pub mod arbitrator;
pub mod config;
pub mod control;
pub mod decision;
pub mod error;
pub mod executor;
pub mod input;
pub mod perception;
pub mod pursuit;
pub mod state;
pub mod streamer;

#[cfg(test)]
mod mock;

pub use arbitrator::Arbitrator;
pub use config::{ControlPolicy, ExecutorPolicy, PursuitPolicy};
pub use control::ControlLoop;
pub use decision::{DecisionSource, FollowFirstTarget};
pub use error::ExecutionError;
pub use executor::{Executor, ExecutorState};
pub use input::{HumanInput, InputError};
pub use perception::{ManualTargets, TrackSource};
pub use pursuit::PursuitController;
pub use state::{DroneState, StateStore, TargetTrack};
pub use streamer::SetpointStreamer;
