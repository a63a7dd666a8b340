use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{info, warn};

use crate::vision::{shutdown::ShutdownToken, telemetry};

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

/// Marks a stage that has exited and should no longer be checked.
const RETIRED: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Stage {
    Capture,
    Detection,
}

impl Stage {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Detection => "detection",
        }
    }
}

/// Last heartbeat of each stage of one camera, in epoch milliseconds.
pub(crate) struct CameraHealth {
    camera: Arc<str>,
    capture: AtomicU64,
    detection: AtomicU64,
}

impl CameraHealth {
    pub(crate) fn new(camera: Arc<str>) -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            camera,
            capture: AtomicU64::new(grace_deadline),
            detection: AtomicU64::new(grace_deadline),
        }
    }

    fn slot(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::Capture => &self.capture,
            Stage::Detection => &self.detection,
        }
    }

    pub(crate) fn beat(&self, stage: Stage) {
        let slot = self.slot(stage);
        if slot.load(Ordering::Relaxed) != RETIRED {
            slot.store(current_millis(), Ordering::Relaxed);
        }
    }

    /// Stop watching `stage`; it has exited on purpose.
    pub(crate) fn retire(&self, stage: Stage) {
        self.slot(stage).store(RETIRED, Ordering::Relaxed);
    }

    pub(crate) fn stalled_stages(&self, now: u64, threshold_ms: u64) -> Vec<Stage> {
        [Stage::Capture, Stage::Detection]
            .into_iter()
            .filter(|&stage| {
                let last = self.slot(stage).load(Ordering::Relaxed);
                last != RETIRED && now.saturating_sub(last) > threshold_ms
            })
            .collect()
    }
}

/// Watch every camera's stages and log stalls and recoveries.
///
/// The watchdog only reports; restarting a stalled stage is left to whoever
/// supervises the process.
pub(crate) fn spawn_watchdog(
    cameras: Vec<Arc<CameraHealth>>,
    shutdown: ShutdownToken,
    threshold: Duration,
) -> io::Result<thread::JoinHandle<()>> {
    let threshold_ms = threshold.as_millis() as u64;
    telemetry::spawn_thread("vision-watchdog", move || {
        let mut stalled: HashSet<(usize, Stage)> = HashSet::new();
        while !shutdown.is_requested() {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();
            let mut current = HashSet::new();
            for (idx, health) in cameras.iter().enumerate() {
                for stage in health.stalled_stages(now, threshold_ms) {
                    current.insert((idx, stage));
                    if !stalled.contains(&(idx, stage)) {
                        warn!(
                            camera = %health.camera,
                            stage = stage.label(),
                            "Watchdog detected stalled stage"
                        );
                    }
                }
            }
            for &(idx, stage) in stalled.difference(&current) {
                info!(
                    camera = %cameras[idx].camera,
                    stage = stage.label(),
                    "Stage recovered or exited"
                );
            }
            metrics::gauge!("vision_stalled_stages").set(current.len() as f64);
            stalled = current;
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_health_is_within_grace_period() {
        let health = CameraHealth::new(Arc::from("cam0"));
        assert!(health.stalled_stages(current_millis(), 1_000).is_empty());
    }

    #[test]
    fn silent_stage_is_reported_until_it_beats() {
        let health = CameraHealth::new(Arc::from("cam0"));
        health.beat(Stage::Capture);
        health.beat(Stage::Detection);
        let later = current_millis() + 2_000;
        assert_eq!(
            health.stalled_stages(later, 1_000),
            vec![Stage::Capture, Stage::Detection]
        );
        health.detection.store(later, Ordering::Relaxed);
        assert_eq!(health.stalled_stages(later, 1_000), vec![Stage::Capture]);
    }

    #[test]
    fn retired_stages_are_ignored() {
        let health = CameraHealth::new(Arc::from("cam0"));
        health.retire(Stage::Capture);
        health.beat(Stage::Capture);
        let later = current_millis() + 60_000;
        assert_eq!(health.stalled_stages(later, 1_000), vec![Stage::Detection]);
    }

    #[test]
    fn watchdog_exits_on_shutdown() {
        let shutdown = ShutdownToken::new();
        let handle = spawn_watchdog(
            vec![Arc::new(CameraHealth::new(Arc::from("cam0")))],
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .unwrap();
        shutdown.request();
        handle.join().unwrap();
    }
}
