//! Multi-camera capture, detection and publishing pipeline.
//!
//! Each camera gets a capture thread and a detection thread joined by a
//! capacity-1 latest-wins slot. Detection results fan out to:
//! - `link`: MAVLink named values to the ground station, plus inbound commands.
//! - `server`: MJPEG and JSON endpoints served by Actix Web.
//! - `snapshot`: rate-limited JPEG + JSON files on disk.
//! - `display`: optional on-screen preview pumped from the main thread.
//!
//! `pipeline` owns every thread and tears them down in order on shutdown.

pub use config::{CameraDescriptor, VisionCliArgs, VisionConfig};
pub use pipeline::run;
pub use probe::ProbeArgs;

mod annotation;
mod commands;
mod config;
mod data;
mod display;
mod encoding;
mod handoff;
mod link;
mod mavlink;
mod pipeline;
pub mod probe;
mod processing;
#[cfg(feature = "with-tch")]
mod runtime;
mod server;
mod shutdown;
mod snapshot;
mod source;
mod stream;
mod targeting;
mod telemetry;
mod watchdog;
