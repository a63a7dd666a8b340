//! Latest-wins hand-off queues between pipeline stages.
//!
//! A queue holds at most `capacity` items. Publishing never blocks: when the
//! queue is full the oldest resident item is evicted and the new one takes its
//! place, so a slow consumer only ever sees recent data. Consumers wait with a
//! timeout and learn that every producer is gone through
//! [`RecvTimeoutError::Disconnected`].

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

/// Outcome of a non-blocking publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Publish {
    /// Stored without displacing anything.
    Stored,
    /// Stored after evicting the oldest unread item.
    Replaced,
}

/// Producer side. Cloneable; clones share the eviction lock so the
/// evict-then-insert sequence is atomic across producers.
pub(crate) struct LatestSender<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
    guard: Arc<Mutex<()>>,
}

impl<T> Clone for LatestSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            guard: self.guard.clone(),
        }
    }
}

/// Consumer side.
pub(crate) struct LatestReceiver<T> {
    rx: Receiver<T>,
}

/// Capacity-1 slot used between capture, detection and display.
pub(crate) fn slot<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    bounded_latest(1)
}

/// Latest-wins queue holding up to `capacity` items.
pub(crate) fn bounded_latest<T>(capacity: usize) -> (LatestSender<T>, LatestReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        LatestSender {
            tx,
            evict: rx.clone(),
            guard: Arc::new(Mutex::new(())),
        },
        LatestReceiver { rx },
    )
}

impl<T> LatestSender<T> {
    /// Insert `item`, evicting the oldest queued item if the queue is full.
    pub(crate) fn publish(&self, item: T) -> Publish {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending = item;
        let mut outcome = Publish::Stored;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(back)) => {
                    // The consumer may drain the queue between the two calls;
                    // in that case there is nothing to evict and the retry succeeds.
                    if self.evict.try_recv().is_ok() {
                        outcome = Publish::Replaced;
                    }
                    pending = back;
                }
                // This sender owns a receiver, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => return outcome,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tx.len()
    }
}

impl<T> LatestReceiver<T> {
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn consumer_sees_only_the_newest_item() {
        let (tx, rx) = slot();
        assert_eq!(tx.publish(1), Publish::Stored);
        for value in 2..=50 {
            assert_eq!(tx.publish(value), Publish::Replaced);
            assert_eq!(tx.len(), 1);
        }
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Ok(50));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn wait_is_bounded_and_reports_disconnect() {
        let (tx, rx) = slot::<u32>();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );
        tx.publish(7);
        drop(tx);
        assert_eq!(rx.recv_timeout(Duration::from_millis(20)), Ok(7));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn wider_queue_drops_oldest_first() {
        let (tx, rx) = bounded_latest(2);
        tx.publish("a");
        tx.publish("b");
        assert_eq!(tx.publish("c"), Publish::Replaced);
        assert_eq!(rx.try_recv(), Ok("b"));
        assert_eq!(rx.try_recv(), Ok("c"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn concurrent_consumer_never_goes_backwards() {
        let (tx, rx) = slot::<u64>();
        let producer = thread::spawn(move || {
            for value in 0..20_000u64 {
                tx.publish(value);
            }
        });

        let mut last: Option<u64> = None;
        loop {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(value) => {
                    if let Some(prev) = last {
                        assert!(value > prev, "received {value} after {prev}");
                    }
                    last = Some(value);
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => panic!("producer stalled"),
            }
        }
        producer.join().unwrap();
        assert_eq!(last, Some(19_999));
    }

    #[test]
    fn cloned_producers_share_capacity() {
        let (tx, rx) = slot::<u8>();
        let other = tx.clone();
        tx.publish(1);
        assert_eq!(other.publish(2), Publish::Replaced);
        assert_eq!(rx.try_recv(), Ok(2));
    }
}
