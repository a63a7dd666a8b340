//! Main-thread display aggregation.
//!
//! Every camera publishes annotated frames into its own capacity-1 slot; the
//! aggregator drains whatever is newest on each pump and hands it to a
//! [`DisplaySink`]. Window toolkits generally insist on being driven from the
//! main thread, so the pipeline supervisor calls [`DisplayAggregator::pump`]
//! from its loop instead of spawning a thread.

use anyhow::Result;
use tracing::warn;

use crate::vision::{
    data::AnnotatedFrame,
    handoff::{LatestReceiver, LatestSender, slot},
};

/// Something that can put frames on screen.
pub(crate) trait DisplaySink {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()>;

    /// True once the user asked to quit (window closed, key pressed).
    fn poll_quit(&mut self) -> bool {
        false
    }

    /// Release windows. Called exactly once.
    fn close(&mut self);
}

pub(crate) struct DisplayAggregator {
    slots: Vec<LatestReceiver<AnnotatedFrame>>,
    sink: Box<dyn DisplaySink>,
    closed: bool,
    failures: u64,
}

impl DisplayAggregator {
    pub(crate) fn new(sink: Box<dyn DisplaySink>) -> Self {
        Self {
            slots: Vec::new(),
            sink,
            closed: false,
            failures: 0,
        }
    }

    /// New slot for one camera's annotated frames.
    pub(crate) fn attach(&mut self) -> LatestSender<AnnotatedFrame> {
        let (tx, rx) = slot();
        self.slots.push(rx);
        tx
    }

    /// Show the newest frame of every camera that produced one since the
    /// last pump. Returns true when the sink asked to quit.
    pub(crate) fn pump(&mut self) -> bool {
        if self.closed {
            return false;
        }
        for rx in &self.slots {
            if let Ok(frame) = rx.try_recv() {
                if let Err(err) = self.sink.show(&frame) {
                    if self.failures == 0 {
                        warn!(stream = %frame.stream, "Display failed: {err:#}");
                    }
                    self.failures += 1;
                }
            }
        }
        self.sink.poll_quit()
    }

    pub(crate) fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sink.close();
        }
    }
}

impl Drop for DisplayAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "highgui")]
pub(crate) use highgui_sink::HighGuiSink;

#[cfg(feature = "highgui")]
mod highgui_sink {
    use anyhow::{Context, Result};
    use opencv::{
        core::{CV_8UC3, Mat, Scalar},
        highgui,
        prelude::*,
    };

    use super::DisplaySink;
    use crate::vision::data::AnnotatedFrame;

    const ESC: i32 = 27;

    /// OpenCV HighGUI windows, one per stream.
    #[derive(Default)]
    pub(crate) struct HighGuiSink {
        quit: bool,
    }

    impl DisplaySink for HighGuiSink {
        fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
            let (width, height) = frame.image.dimensions();
            let mut mat = Mat::new_rows_cols_with_default(
                height as i32,
                width as i32,
                CV_8UC3,
                Scalar::all(0.0),
            )
            .context("failed to allocate display buffer")?;
            let dst = mat.data_bytes_mut().context("display buffer not continuous")?;
            for (out, px) in dst.chunks_exact_mut(3).zip(frame.image.pixels()) {
                out[0] = px[2];
                out[1] = px[1];
                out[2] = px[0];
            }
            highgui::imshow(&frame.stream, &mat).context("imshow failed")?;
            Ok(())
        }

        fn poll_quit(&mut self) -> bool {
            if let Ok(key) = highgui::wait_key(1) {
                if key == ESC || key == i32::from(b'q') {
                    self.quit = true;
                }
            }
            self.quit
        }

        fn close(&mut self) {
            let _ = highgui::destroy_all_windows();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use image::RgbImage;

    use super::*;

    #[derive(Default)]
    struct Recorded {
        shown: Vec<(String, u64)>,
        closes: usize,
    }

    struct FakeSink {
        log: Arc<Mutex<Recorded>>,
        quit_after: usize,
        fail: bool,
    }

    impl DisplaySink for FakeSink {
        fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
            if self.fail {
                return Err(anyhow!("no screen"));
            }
            self.log
                .lock()
                .unwrap()
                .shown
                .push((frame.stream.to_string(), frame.frame_number));
            Ok(())
        }

        fn poll_quit(&mut self) -> bool {
            self.log.lock().unwrap().shown.len() >= self.quit_after
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }
    }

    fn frame(stream: &str, frame_number: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            stream: Arc::from(stream),
            image: RgbImage::new(2, 2),
            timestamp_ms: 0,
            frame_number,
        }
    }

    #[test]
    fn shows_newest_frame_per_camera_and_closes_once() {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let mut aggregator = DisplayAggregator::new(Box::new(FakeSink {
            log: log.clone(),
            quit_after: 3,
            fail: false,
        }));
        let cam0 = aggregator.attach();
        let cam1 = aggregator.attach();
        for n in 1..=5 {
            cam0.publish(frame("cam0", n));
        }
        cam1.publish(frame("cam1", 1));

        assert!(!aggregator.pump());
        assert_eq!(
            log.lock().unwrap().shown,
            vec![("cam0".to_string(), 5), ("cam1".to_string(), 1)]
        );

        cam0.publish(frame("cam0", 6));
        assert!(aggregator.pump());

        aggregator.close();
        drop(aggregator);
        assert_eq!(log.lock().unwrap().closes, 1);
    }

    #[test]
    fn sink_errors_do_not_stop_the_aggregator() {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let mut aggregator = DisplayAggregator::new(Box::new(FakeSink {
            log: log.clone(),
            quit_after: usize::MAX,
            fail: true,
        }));
        let cam0 = aggregator.attach();
        cam0.publish(frame("cam0", 1));
        assert!(!aggregator.pump());
        cam0.publish(frame("cam0", 2));
        assert!(!aggregator.pump());
        assert_eq!(aggregator.failures, 2);
    }
}
