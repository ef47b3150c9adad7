//! Target following.
//!
//! A background loop re-reads the perception tracks, places the vehicle a
//! fixed standoff behind the chosen target and feeds that point to the
//! setpoint stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use aero_proto::PositionNedYaw;

use crate::config::PursuitPolicy;
use crate::state::{StateStore, TargetTrack};
use crate::streamer::SetpointStreamer;

/// Below this ground speed a track has no usable heading.
const MIN_HEADING_SPEED_M_S: f64 = 0.2;

/// Setpoint `standoff_m` behind the track, opposite its direction of travel
/// (due south of it when stationary), at the follow altitude, facing the track.
pub fn follow_setpoint(track: &TargetTrack, policy: &PursuitPolicy) -> PositionNedYaw {
    let v = track.velocity;
    let speed = v.north_m_s.hypot(v.east_m_s);
    let (un, ue) = if speed > MIN_HEADING_SPEED_M_S {
        (v.north_m_s / speed, v.east_m_s / speed)
    } else {
        (1.0, 0.0)
    };
    let north = track.position.north_m - un * policy.standoff_m;
    let east = track.position.east_m - ue * policy.standoff_m;
    let yaw = (track.position.east_m - east)
        .atan2(track.position.north_m - north)
        .to_degrees()
        .rem_euclid(360.0);
    PositionNedYaw::at_altitude(north, east, policy.altitude_m, yaw)
}

struct PursuitTask {
    requested: Option<String>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PursuitController {
    store: StateStore,
    streamer: Arc<Mutex<SetpointStreamer>>,
    policy: PursuitPolicy,
    task: Option<PursuitTask>,
    selected: Arc<StdMutex<Option<String>>>,
    live: Arc<AtomicUsize>,
    spawned: usize,
}

impl PursuitController {
    pub fn new(store: StateStore, streamer: Arc<Mutex<SetpointStreamer>>, policy: PursuitPolicy) -> Self {
        Self {
            store,
            streamer,
            policy,
            task: None,
            selected: Arc::new(StdMutex::new(None)),
            live: Arc::new(AtomicUsize::new(0)),
            spawned: 0,
        }
    }

    pub fn policy(&self) -> &PursuitPolicy {
        &self.policy
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false)
    }

    /// Target id the running pursuit was started for, if any.
    pub fn requested_target(&self) -> Option<&str> {
        self.task.as_ref().and_then(|t| t.requested.as_deref())
    }

    /// Track id the loop is currently following.
    pub fn selected_target(&self) -> Option<String> {
        self.selected.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn spawned_tasks(&self) -> usize {
        self.spawned
    }

    /// Starts following `target_id` (or whatever track is available). A running
    /// pursuit for the same request is left alone; one for another id is replaced.
    pub async fn start(&mut self, target_id: Option<String>) {
        if self.is_running() && self.requested_target() == target_id.as_deref() {
            debug!("pursuit: already following {:?}", target_id);
            return;
        }
        self.stop().await;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        let lp = PursuitLoop {
            store: self.store.clone(),
            streamer: self.streamer.clone(),
            policy: self.policy.clone(),
            requested: target_id.clone(),
            selected: self.selected.clone(),
        };
        let handle = tokio::spawn(lp.run(stop_rx, guard));
        self.spawned += 1;
        info!("pursuit: started for {:?}", target_id);
        self.task = Some(PursuitTask { requested: target_id, stop: stop_tx, handle });
        self.store.set_autonomous_following_active(true);
    }

    /// Cancels and awaits the pursuit loop. No-op when none is running.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = task.stop.send(());
        if let Err(e) = task.handle.await {
            warn!("pursuit: task ended abnormally: {}", e);
        }
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.store.set_autonomous_following_active(false);
        info!("pursuit: stopped");
    }
}

struct PursuitLoop {
    store: StateStore,
    streamer: Arc<Mutex<SetpointStreamer>>,
    policy: PursuitPolicy,
    requested: Option<String>,
    selected: Arc<StdMutex<Option<String>>>,
}

impl PursuitLoop {
    async fn run(self, mut stop: oneshot::Receiver<()>, _live: LiveGuard) {
        let mut holding = false;
        loop {
            self.tick(&mut holding).await;
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(self.policy.interval()) => {}
            }
        }
    }

    async fn tick(&self, holding: &mut bool) {
        let st = self.store.snapshot();
        let Some(track) = st.select_track(self.requested.as_deref(), self.policy.track_max_age()) else {
            if !*holding {
                warn!("pursuit: no target in view, holding last setpoint");
                *holding = true;
            }
            return;
        };
        *holding = false;

        {
            let mut sel = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
            if sel.as_deref() != Some(track.id.as_str()) {
                info!("pursuit: following {}", track.id);
                *sel = Some(track.id.clone());
            }
        }

        let desired = follow_setpoint(track, &self.policy);
        let error_m = st.vehicle.position.horizontal_distance_m(&desired.position());
        let mut streamer = self.streamer.lock().await;
        if !streamer.is_running() {
            warn!("pursuit: setpoint stream not running, restarting");
            streamer.start(desired).await;
        } else if error_m > self.policy.reposition_threshold_m {
            debug!("pursuit: {:.1} m off, restarting stream", error_m);
            streamer.start(desired).await;
        } else {
            streamer.update_in_place(desired);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockLink;
    use aero_proto::{PositionNed, VehicleSnapshot, VelocityNed};
    use tokio::time::Instant;

    fn track(id: &str, north_m: f64, east_m: f64, velocity: VelocityNed) -> TargetTrack {
        TargetTrack {
            id: id.into(),
            position: PositionNed::new(north_m, east_m, 0.0),
            velocity,
            last_observed_at: Instant::now(),
        }
    }

    fn setup() -> (StateStore, Arc<Mutex<SetpointStreamer>>, PursuitController) {
        let store = StateStore::new();
        let streamer = Arc::new(Mutex::new(SetpointStreamer::new(MockLink::new(), Duration::from_millis(100))));
        let pursuit = PursuitController::new(store.clone(), streamer.clone(), PursuitPolicy::default());
        (store, streamer, pursuit)
    }

    #[test]
    fn standoff_is_behind_direction_of_travel() {
        let policy = PursuitPolicy::default();

        let sp = follow_setpoint(&track("a", 20.0, 0.0, VelocityNed::default()), &policy);
        assert!((sp.north_m - 15.0).abs() < 1e-9);
        assert!(sp.east_m.abs() < 1e-9);
        assert!((sp.down_m + 10.0).abs() < 1e-9);
        assert!(sp.yaw_deg.abs() < 1e-9);

        let sp = follow_setpoint(&track("a", 20.0, 0.0, VelocityNed::new(0.0, 2.0, 0.0)), &policy);
        assert!((sp.north_m - 20.0).abs() < 1e-9);
        assert!((sp.east_m + 5.0).abs() < 1e-9);
        assert!((sp.yaw_deg - 90.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn far_target_starts_stream_near_target_updates_in_place() {
        let (store, streamer, mut pursuit) = setup();
        store.update_tracks(vec![track("p1", 20.0, 0.0, VelocityNed::default())]);
        pursuit.start(None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let s = streamer.lock().await;
            assert!(s.is_running());
            assert_eq!(s.spawned_tasks(), 1);
            assert!((s.current().north_m - 15.0).abs() < 1e-9);
        }
        assert_eq!(pursuit.selected_target().as_deref(), Some("p1"));
        assert!(store.snapshot().autonomous_following_active);

        store.update_vehicle_snapshot(VehicleSnapshot {
            position: PositionNed::new(14.0, 0.0, -10.0),
            ..Default::default()
        });
        store.update_tracks(vec![track("p1", 21.0, 0.0, VelocityNed::default())]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        {
            let s = streamer.lock().await;
            assert_eq!(s.spawned_tasks(), 1);
            assert!((s.current().north_m - 16.0).abs() < 1e-9);
        }

        pursuit.stop().await;
        assert_eq!(pursuit.live_tasks(), 0);
        assert_eq!(pursuit.selected_target(), None);
        assert!(!store.snapshot().autonomous_following_active);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_stream_is_restarted_while_on_station() {
        let store = StateStore::new();
        let link = MockLink::new();
        let streamer = Arc::new(Mutex::new(SetpointStreamer::new(link.clone(), Duration::from_millis(100))));
        let mut pursuit = PursuitController::new(store.clone(), streamer.clone(), PursuitPolicy::default());
        // vehicle already sits at the standoff point
        store.update_vehicle_snapshot(VehicleSnapshot {
            position: PositionNed::new(0.0, 0.0, -10.0),
            ..Default::default()
        });
        store.update_tracks(vec![track("p1", 5.0, 0.0, VelocityNed::default())]);

        pursuit.start(None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(streamer.lock().await.is_running());

        link.fail("setpoint");
        tokio::time::sleep(Duration::from_millis(300)).await;
        link.heal("setpoint");
        store.update_tracks(vec![track("p1", 5.0, 0.0, VelocityNed::default())]);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let s = streamer.lock().await;
        assert!(s.is_running());
        assert!(s.spawned_tasks() > 1);
        assert_eq!(s.live_tasks(), 1);
        drop(s);
        let sent = link.setpoints().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(link.setpoints().len() > sent);
        pursuit.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_track_holds() {
        let (_store, streamer, mut pursuit) = setup();
        pursuit.start(Some("ghost".into())).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pursuit.is_running());
        assert_eq!(pursuit.selected_target(), None);
        assert!(!streamer.lock().await.is_running());
        pursuit.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_only_for_different_target() {
        let (store, _streamer, mut pursuit) = setup();
        store.update_tracks(vec![
            track("a", 10.0, 0.0, VelocityNed::default()),
            track("b", 0.0, 10.0, VelocityNed::default()),
        ]);
        pursuit.start(Some("a".into())).await;
        pursuit.start(Some("a".into())).await;
        assert_eq!(pursuit.spawned_tasks(), 1);

        pursuit.start(Some("b".into())).await;
        assert_eq!(pursuit.spawned_tasks(), 2);
        assert_eq!(pursuit.live_tasks(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pursuit.selected_target().as_deref(), Some("b"));
        pursuit.stop().await;
        pursuit.stop().await;
        assert_eq!(pursuit.live_tasks(), 0);
    }
}
