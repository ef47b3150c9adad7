use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info};

use aero_proto::{Command, PositionNed, VehicleSnapshot, VelocityNed};

/// A tracked object as estimated by perception, in the vehicle's NED frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetTrack {
    pub id: String,
    pub position: PositionNed,
    pub velocity: VelocityNed,
    pub last_observed_at: Instant,
}

impl TargetTrack {
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.last_observed_at.elapsed() <= max_age
    }
}

/// Everything the decision source and the pursuit loop see about the world.
#[derive(Debug, Clone)]
pub struct DroneState {
    pub vehicle: VehicleSnapshot,
    pub tracks: Vec<TargetTrack>,
    pub last_executed_command: Option<Command>,
    pub human_control_active: bool,
    pub autonomous_following_active: bool,
    pub mission_objective: String,
    pub updated_at: OffsetDateTime,
}

impl Default for DroneState {
    fn default() -> Self {
        Self {
            vehicle: VehicleSnapshot::default(),
            tracks: Vec::new(),
            last_executed_command: None,
            human_control_active: true,
            autonomous_following_active: false,
            mission_objective: String::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

impl DroneState {
    pub fn fresh_tracks(&self, max_age: Duration) -> impl Iterator<Item = &TargetTrack> {
        self.tracks.iter().filter(move |t| t.is_fresh(max_age))
    }

    /// Track with `id` if present and fresh, else the first fresh track.
    pub fn select_track(&self, id: Option<&str>, max_age: Duration) -> Option<&TargetTrack> {
        id.and_then(|id| self.fresh_tracks(max_age).find(|t| t.id == id))
            .or_else(|| self.fresh_tracks(max_age).next())
    }
}

/// Single writer of [`DroneState`]. Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<DroneState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, DroneState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DroneState> {
        let mut st = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        st.updated_at = OffsetDateTime::now_utc();
        st
    }

    pub fn snapshot(&self) -> DroneState {
        self.read().clone()
    }

    pub fn update_vehicle_snapshot(&self, vehicle: VehicleSnapshot) {
        self.write().vehicle = vehicle;
    }

    pub fn update_tracks(&self, tracks: Vec<TargetTrack>) {
        self.write().tracks = tracks;
    }

    pub fn set_human_control_active(&self, active: bool) {
        let mut st = self.write();
        if st.human_control_active != active {
            info!("human control: {} -> {}", st.human_control_active, active);
            st.human_control_active = active;
        }
    }

    pub fn set_autonomous_following_active(&self, active: bool) {
        let mut st = self.write();
        if st.autonomous_following_active != active {
            info!("autonomous following: {} -> {}", st.autonomous_following_active, active);
            st.autonomous_following_active = active;
        }
    }

    pub fn set_last_executed_command(&self, cmd: Command) {
        debug!("last executed command: {}", cmd.kind());
        self.write().last_executed_command = Some(cmd);
    }

    pub fn set_mission_objective(&self, objective: impl Into<String>) {
        let objective = objective.into();
        info!("mission objective: {}", objective);
        self.write().mission_objective = objective;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, north_m: f64) -> TargetTrack {
        TargetTrack {
            id: id.into(),
            position: PositionNed::new(north_m, 0.0, 0.0),
            velocity: VelocityNed::default(),
            last_observed_at: Instant::now(),
        }
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = StateStore::new();
        let before = store.snapshot();
        store.update_tracks(vec![track("a", 1.0)]);
        store.set_human_control_active(false);
        assert!(before.tracks.is_empty());
        assert!(before.human_control_active);

        let after = store.snapshot();
        assert_eq!(after.tracks.len(), 1);
        assert!(!after.human_control_active);
    }

    #[test]
    fn setters_replace_fields_wholesale() {
        let store = StateStore::new();
        store.update_tracks(vec![track("a", 1.0), track("b", 2.0)]);
        store.update_tracks(vec![track("c", 3.0)]);
        let ids: Vec<_> = store.snapshot().tracks.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["c"]);

        store.set_last_executed_command(Command::land("test"));
        store.set_autonomous_following_active(true);
        let st = store.snapshot();
        assert_eq!(st.last_executed_command, Some(Command::land("test")));
        assert!(st.autonomous_following_active);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_prefers_id_then_first_fresh() {
        let store = StateStore::new();
        let mut stale = track("old", 0.0);
        stale.last_observed_at = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;
        store.update_tracks(vec![stale, track("a", 1.0), track("b", 2.0)]);

        let st = store.snapshot();
        let max_age = Duration::from_secs(2);
        assert_eq!(st.select_track(Some("b"), max_age).map(|t| t.id.as_str()), Some("b"));
        assert_eq!(st.select_track(Some("zzz"), max_age).map(|t| t.id.as_str()), Some("a"));
        assert_eq!(st.select_track(None, max_age).map(|t| t.id.as_str()), Some("a"));
        assert_eq!(st.select_track(Some("old"), max_age).map(|t| t.id.as_str()), Some("a"));
        assert_eq!(st.fresh_tracks(max_age).count(), 2);
    }
}
