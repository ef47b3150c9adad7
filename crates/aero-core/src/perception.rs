//! Perception boundary.

use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tokio::time::Instant;
use tracing::info;

use aero_proto::{PositionNed, VelocityNed};

use crate::state::TargetTrack;

/// Supplies the current set of tracked objects once per control cycle.
pub trait TrackSource: Send + Sync {
    fn tracks(&self) -> Vec<TargetTrack>;

    /// Places a synthetic detection near `vehicle`. Returns false when the
    /// source does not support operator injection.
    fn inject_synthetic(&self, _vehicle: PositionNed) -> bool {
        false
    }

    fn clear_synthetic(&self) {}
}

/// Distance ahead (north) of the vehicle where a synthetic target appears.
pub const SYNTHETIC_DISTANCE_M: f64 = 15.0;
const MAX_DRIFT_M_S: f64 = 0.5;

#[derive(Debug, Clone)]
struct Synthetic {
    id: String,
    origin: PositionNed,
    velocity: VelocityNed,
    placed_at: Instant,
}

/// Operator-driven stand-in for a detector: one synthetic person that walks
/// slowly in a random direction until cleared.
#[derive(Debug, Clone, Default)]
pub struct ManualTargets {
    inner: Arc<Mutex<(u32, Option<Synthetic>)>>,
}

impl ManualTargets {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackSource for ManualTargets {
    fn tracks(&self) -> Vec<TargetTrack> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(s) = guard.1.as_ref() else {
            return Vec::new();
        };
        let dt = s.placed_at.elapsed().as_secs_f64();
        vec![TargetTrack {
            id: s.id.clone(),
            position: PositionNed::new(
                s.origin.north_m + s.velocity.north_m_s * dt,
                s.origin.east_m + s.velocity.east_m_s * dt,
                s.origin.down_m,
            ),
            velocity: s.velocity,
            last_observed_at: Instant::now(),
        }]
    }

    fn inject_synthetic(&self, vehicle: PositionNed) -> bool {
        let mut rng = rand::thread_rng();
        let heading = rng.gen_range(0.0..std::f64::consts::TAU);
        let speed = rng.gen_range(0.0..MAX_DRIFT_M_S);

        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.0 += 1;
        let id = format!("person-{}", guard.0);
        info!("perception: synthetic {} placed {} m ahead", id, SYNTHETIC_DISTANCE_M);
        guard.1 = Some(Synthetic {
            id,
            origin: PositionNed::new(vehicle.north_m + SYNTHETIC_DISTANCE_M, vehicle.east_m, 0.0),
            velocity: VelocityNed::new(speed * heading.cos(), speed * heading.sin(), 0.0),
            placed_at: Instant::now(),
        });
        true
    }

    fn clear_synthetic(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = guard.1.take() {
            info!("perception: synthetic {} cleared", s.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn synthetic_target_appears_ahead_and_drifts() {
        let targets = ManualTargets::new();
        assert!(targets.tracks().is_empty());

        assert!(targets.inject_synthetic(PositionNed::new(2.0, 3.0, -10.0)));
        let first = targets.tracks();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "person-1");
        assert!((first[0].position.north_m - 17.0).abs() < 1e-9);
        assert!((first[0].position.east_m - 3.0).abs() < 1e-9);
        assert!(first[0].velocity.ground_speed_m_s() < MAX_DRIFT_M_S);

        tokio::time::advance(Duration::from_secs(10)).await;
        let later = targets.tracks();
        assert!(later[0].position.horizontal_distance_m(&first[0].position) <= MAX_DRIFT_M_S * 10.0 + 1e-9);
        assert!(later[0].is_fresh(Duration::from_millis(1)));

        targets.inject_synthetic(PositionNed::default());
        assert_eq!(targets.tracks()[0].id, "person-2");
        targets.clear_synthetic();
        assert!(targets.tracks().is_empty());
    }
}
