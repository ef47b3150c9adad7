//! Continuous setpoint stream.
//!
//! Offboard control on both PX4 and ArduPilot drops out when setpoints stop
//! arriving, so while the vehicle is in continuous-setpoint mode one background
//! task re-sends the current setpoint at a fixed cadence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use aero_fc::{LinkError, VehicleLink};
use aero_proto::PositionNedYaw;

struct StreamTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Decrements the live counter when the task body ends, however it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SetpointStreamer {
    link: Arc<dyn VehicleLink>,
    cadence: Duration,
    current: watch::Sender<PositionNedYaw>,
    task: Option<StreamTask>,
    live: Arc<AtomicUsize>,
    spawned: usize,
}

impl SetpointStreamer {
    pub fn new(link: Arc<dyn VehicleLink>, cadence: Duration) -> Self {
        let (current, _) = watch::channel(PositionNedYaw::default());
        Self { link, cadence, current, task: None, live: Arc::new(AtomicUsize::new(0)), spawned: 0 }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Setpoint the stream is sending (or last sent).
    pub fn current(&self) -> PositionNedYaw {
        *self.current.borrow()
    }

    /// True while a stream task exists and has not exited on its own.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false)
    }

    /// Stream tasks currently alive.
    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Stream tasks spawned since construction.
    pub fn spawned_tasks(&self) -> usize {
        self.spawned
    }

    /// Stops any running stream, waits for it to finish, then streams `sp`.
    pub async fn start(&mut self, sp: PositionNedYaw) {
        self.stop().await;
        self.current.send_replace(sp);

        let (stop_tx, stop_rx) = oneshot::channel();
        let guard = LiveGuard::enter(&self.live);
        let handle = tokio::spawn(run(self.link.clone(), self.current.subscribe(), self.cadence, stop_rx, guard));
        self.spawned += 1;
        self.task = Some(StreamTask { stop: stop_tx, handle });
        info!(
            "stream: started n={:.1} e={:.1} d={:.1} yaw={:.0}",
            sp.north_m, sp.east_m, sp.down_m, sp.yaw_deg
        );
    }

    /// Changes the streamed setpoint without restarting the task.
    pub fn update_in_place(&self, sp: PositionNedYaw) {
        self.current.send_replace(sp);
    }

    /// Cancels and awaits the stream task. No-op when none is running.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = task.stop.send(());
        if let Err(e) = task.handle.await {
            warn!("stream: task ended abnormally: {}", e);
        }
        info!("stream: stopped");
    }

    /// Sends `sp` `count` times at the stream cadence and makes it current.
    /// Autopilots refuse offboard until setpoints are already flowing.
    pub async fn prime(&mut self, sp: PositionNedYaw, count: u32) -> Result<(), LinkError> {
        self.current.send_replace(sp);
        for i in 0..count {
            self.link.send_setpoint(sp).await?;
            if i + 1 < count {
                tokio::time::sleep(self.cadence).await;
            }
        }
        debug!("stream: primed with {} setpoints", count);
        Ok(())
    }
}

async fn run(
    link: Arc<dyn VehicleLink>,
    mut current: watch::Receiver<PositionNedYaw>,
    cadence: Duration,
    mut stop: oneshot::Receiver<()>,
    _live: LiveGuard,
) {
    loop {
        let sp = *current.borrow_and_update();
        if let Err(e) = link.send_setpoint(sp).await {
            warn!("stream: setpoint send failed, stream exiting: {}", e);
            return;
        }
        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(cadence) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;

    const CADENCE: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn streams_current_setpoint_at_cadence() {
        let link = MockLink::new();
        let mut streamer = SetpointStreamer::new(link.clone(), CADENCE);
        let a = PositionNedYaw::at_altitude(1.0, 0.0, 5.0, 0.0);
        streamer.start(a).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(streamer.is_running());
        assert_eq!(link.setpoints().len(), 5);

        let b = PositionNedYaw::at_altitude(2.0, 0.0, 5.0, 90.0);
        streamer.update_in_place(b);
        tokio::time::sleep(CADENCE).await;
        assert_eq!(link.setpoints().last(), Some(&b));
        assert_eq!(streamer.current(), b);
        assert_eq!(streamer.spawned_tasks(), 1);

        streamer.stop().await;
        let sent = link.setpoints().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(link.setpoints().len(), sent);
        assert_eq!(streamer.live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_never_overlaps() {
        let link = MockLink::new();
        let mut streamer = SetpointStreamer::new(link.clone(), CADENCE);
        for i in 0..5 {
            streamer.start(PositionNedYaw::at_altitude(i as f64, 0.0, 5.0, 0.0)).await;
            assert_eq!(streamer.live_tasks(), 1);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(streamer.spawned_tasks(), 5);
        streamer.stop().await;
        streamer.stop().await;
        assert_eq!(streamer.live_tasks(), 0);
        assert!(!streamer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_ends_task() {
        let link = MockLink::new();
        let mut streamer = SetpointStreamer::new(link.clone(), CADENCE);
        link.fail("setpoint");
        streamer.start(PositionNedYaw::at_altitude(0.0, 0.0, 5.0, 0.0)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!streamer.is_running());
        assert_eq!(streamer.live_tasks(), 0);
        assert_eq!(link.setpoints().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prime_sends_count_setpoints() {
        let link = MockLink::new();
        let mut streamer = SetpointStreamer::new(link.clone(), CADENCE);
        let sp = PositionNedYaw::at_altitude(3.0, 4.0, 6.0, 0.0);
        streamer.prime(sp, 10).await.unwrap();
        assert_eq!(link.setpoints(), vec![sp; 10]);
        assert_eq!(streamer.current(), sp);
        assert!(!streamer.is_running());
    }
}
