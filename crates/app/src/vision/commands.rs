use std::{
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::Arc,
};

use tracing::{debug, error, info, warn};

use crate::vision::{
    link::CommandSignal,
    snapshot::{SnapshotKind, SnapshotPayload, SnapshotRequest, SnapshotSubmitter},
    stream::StreamHub,
};

/// Turns ground-station commands into actions.
///
/// `picture` saves the newest frame of every stream as a manual snapshot.
/// `generate` runs the configured map-generation command through `sh -c`,
/// with `VISION_SNAPSHOT_DIR` pointing at the snapshot directory; only one
/// run is in flight at a time.
pub(crate) struct CommandDispatcher {
    hub: Arc<StreamHub>,
    snapshots: Option<SnapshotSubmitter>,
    snapshot_dir: Option<PathBuf>,
    on_generate: Option<String>,
    generator: Option<Child>,
    launches: u64,
}

impl CommandDispatcher {
    pub(crate) fn new(
        hub: Arc<StreamHub>,
        snapshots: Option<SnapshotSubmitter>,
        snapshot_dir: Option<PathBuf>,
        on_generate: Option<String>,
    ) -> Self {
        Self {
            hub,
            snapshots,
            snapshot_dir,
            on_generate,
            generator: None,
            launches: 0,
        }
    }

    pub(crate) fn dispatch(&mut self, signal: CommandSignal) {
        info!(command = signal.as_str(), "Ground-station command received");
        match signal {
            CommandSignal::Picture => self.take_pictures(),
            CommandSignal::Generate => self.start_generation(),
            CommandSignal::Other(token) => debug!(token = %token, "ignoring unknown command"),
        }
    }

    fn take_pictures(&self) {
        let Some(submitter) = &self.snapshots else {
            warn!("Picture requested but snapshots are disabled");
            return;
        };
        let mut queued = 0usize;
        for name in self.hub.names() {
            if let Some(packet) = self.hub.latest(name) {
                submitter.submit(SnapshotRequest {
                    camera: name.clone(),
                    kind: SnapshotKind::Manual,
                    frame_number: packet.frame_number,
                    timestamp_ms: packet.timestamp_ms,
                    detections: packet.detections,
                    payload: SnapshotPayload::Jpeg(packet.jpeg),
                });
                queued += 1;
            }
        }
        info!(streams = queued, "Manual snapshots queued");
    }

    fn start_generation(&mut self) {
        self.reap();
        let Some(command) = self.on_generate.as_deref() else {
            warn!("Map generation requested but no --on-generate command is configured");
            return;
        };
        if self.generator.is_some() {
            info!("Map generation already running");
            return;
        }
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.snapshot_dir {
            process.env("VISION_SNAPSHOT_DIR", dir);
        }
        match process.spawn() {
            Ok(child) => {
                info!(pid = child.id(), command, "Map generation started");
                self.generator = Some(child);
                self.launches += 1;
            }
            Err(err) => error!(command, "Failed to start map generation: {err}"),
        }
    }

    /// Collect the generation process if it has exited.
    pub(crate) fn reap(&mut self) {
        let Some(child) = self.generator.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                info!("Map generation finished");
                self.generator = None;
            }
            Ok(Some(status)) => {
                warn!(%status, "Map generation failed");
                self.generator = None;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to poll map generation: {err}");
                self.generator = None;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_generating(&self) -> bool {
        self.generator.is_some()
    }

    /// Stop a running generation and release the snapshot submitter.
    pub(crate) fn shutdown(&mut self) {
        if let Some(mut child) = self.generator.take() {
            warn!(pid = child.id(), "Stopping map generation for shutdown");
            let _ = child.kill();
            let _ = child.wait();
        }
        self.snapshots = None;
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
