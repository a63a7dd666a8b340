use std::sync::{Arc, Mutex, PoisonError};

use crate::vision::data::{FramePacket, SharedFrame};

/// Latest encoded frame of every camera stream.
///
/// The set of streams is fixed at construction, so lookups need no outer
/// lock; each entry is written by exactly one detection task and read by any
/// number of HTTP clients.
pub(crate) struct StreamHub {
    streams: Vec<(Arc<str>, SharedFrame)>,
}

impl StreamHub {
    pub(crate) fn new<I>(names: I) -> Self
    where
        I: IntoIterator<Item = Arc<str>>,
    {
        Self {
            streams: names
                .into_iter()
                .map(|name| (name, Arc::new(Mutex::new(None))))
                .collect(),
        }
    }

    fn slot(&self, stream: &str) -> Option<&SharedFrame> {
        self.streams
            .iter()
            .find(|(name, _)| &**name == stream)
            .map(|(_, slot)| slot)
    }

    /// Replace the stream's frame. Returns `false` for unknown streams.
    pub(crate) fn publish(&self, stream: &str, packet: FramePacket) -> bool {
        match self.slot(stream) {
            Some(slot) => {
                let previous = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(packet);
                drop(previous);
                true
            }
            None => false,
        }
    }

    pub(crate) fn latest(&self, stream: &str) -> Option<FramePacket> {
        self.slot(stream)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn contains(&self, stream: &str) -> bool {
        self.slot(stream).is_some()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.streams.iter().map(|(name, _)| name)
    }
}

#[cfg(test)]
mod tests {
    use actix_web::web::Bytes;

    use super::*;

    fn packet(frame_number: u64) -> FramePacket {
        FramePacket {
            jpeg: Bytes::from_static(b"jpeg"),
            detections: Vec::new(),
            timestamp_ms: 0,
            frame_number,
            fps: 0.0,
        }
    }

    #[test]
    fn last_write_wins_per_stream() {
        let hub = StreamHub::new([Arc::from("cam0"), Arc::from("cam1")]);
        assert!(hub.latest("cam0").is_none());
        assert!(hub.publish("cam0", packet(1)));
        assert!(hub.publish("cam0", packet(2)));
        assert!(hub.publish("cam1", packet(9)));
        assert_eq!(hub.latest("cam0").unwrap().frame_number, 2);
        assert_eq!(hub.latest("cam1").unwrap().frame_number, 9);
    }

    #[test]
    fn unknown_streams_are_rejected() {
        let hub = StreamHub::new([Arc::from("cam0")]);
        assert!(!hub.publish("cam7", packet(1)));
        assert!(!hub.contains("cam7"));
        assert_eq!(hub.names().map(|n| &**n).collect::<Vec<_>>(), vec!["cam0"]);
    }
}
