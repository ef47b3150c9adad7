//! Autonomous decision seam.

use std::time::Duration;

use async_trait::async_trait;

use aero_proto::Command;

use crate::state::DroneState;

/// Proposes the next autonomous command from the current world state. Remote
/// sources should fall back to a hold on any failure of their own.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn propose(&self, state: &DroneState) -> Command;
}

/// Rule-based source: follow the first fresh track, otherwise hold.
#[derive(Debug, Clone)]
pub struct FollowFirstTarget {
    track_max_age: Duration,
}

impl FollowFirstTarget {
    pub fn new(track_max_age: Duration) -> Self {
        Self { track_max_age }
    }
}

#[async_trait]
impl DecisionSource for FollowFirstTarget {
    async fn propose(&self, state: &DroneState) -> Command {
        match state.fresh_tracks(self.track_max_age).next() {
            Some(track) => Command::follow(
                Some(track.id.clone()),
                format!("Target {} detected, following.", track.id),
            ),
            None => Command::do_nothing("No target in view, holding position."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TargetTrack;
    use aero_proto::{ActionKind, PositionNed, VelocityNed};
    use tokio::time::Instant;

    #[tokio::test]
    async fn follows_first_fresh_track() {
        let source = FollowFirstTarget::new(Duration::from_secs(2));
        let mut st = DroneState::default();
        assert_eq!(source.propose(&st).await.kind(), ActionKind::DoNothing);

        st.tracks.push(TargetTrack {
            id: "person-1".into(),
            position: PositionNed::new(15.0, 0.0, 0.0),
            velocity: VelocityNed::default(),
            last_observed_at: Instant::now(),
        });
        let cmd = source.propose(&st).await;
        assert_eq!(cmd, Command::follow(Some("person-1".into()), "Target person-1 detected, following."));
    }
}
