//! Single-slot, overwrite-latest frame hand-off
//!
//! One producer (a camera worker) and one consumer (the display). The sink
//! holds at most one frame; publishing replaces whatever was not yet taken.
//! The producer never blocks and the consumer never waits.

use parking_lot::Mutex;
use std::sync::Arc;

struct Slot<T> {
    latest: Mutex<Option<T>>,
}

/// Producer half
pub struct FrameSender<T> {
    slot: Arc<Slot<T>>,
}

/// Consumer half
pub struct FrameReceiver<T> {
    slot: Arc<Slot<T>>,
}

/// Create a sink of depth one
pub fn frame_sink<T>() -> (FrameSender<T>, FrameReceiver<T>) {
    let slot = Arc::new(Slot { latest: Mutex::new(None) });
    (FrameSender { slot: slot.clone() }, FrameReceiver { slot })
}

impl<T> FrameSender<T> {
    /// Publish a frame, discarding any unconsumed one.
    /// Returns `true` if a stale frame was dropped.
    pub fn publish(&self, frame: T) -> bool {
        self.slot.latest.lock().replace(frame).is_some()
    }

    /// Whether the consumer half still exists
    pub fn is_connected(&self) -> bool {
        Arc::strong_count(&self.slot) > 1
    }
}

impl<T> FrameReceiver<T> {
    /// Take the pending frame, if any
    pub fn try_take(&self) -> Option<T> {
        self.slot.latest.lock().take()
    }

    /// Whether the producer half still exists
    pub fn is_producer_alive(&self) -> bool {
        Arc::strong_count(&self.slot) > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sink_yields_nothing() {
        let (_tx, rx) = frame_sink::<u32>();
        assert_eq!(rx.try_take(), None);
    }

    #[test]
    fn test_publish_then_take() {
        let (tx, rx) = frame_sink();
        assert!(!tx.publish(1));
        assert_eq!(rx.try_take(), Some(1));
        assert_eq!(rx.try_take(), None);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let (tx, rx) = frame_sink();
        assert!(!tx.publish(1));
        assert!(tx.publish(2));
        assert!(tx.publish(3));
        assert_eq!(rx.try_take(), Some(3));
        assert_eq!(rx.try_take(), None);
    }

    #[test]
    fn test_connection_tracking() {
        let (tx, rx) = frame_sink::<u32>();
        assert!(tx.is_connected());
        assert!(rx.is_producer_alive());
        drop(rx);
        assert!(!tx.is_connected());
        // Publishing without a consumer is still non-blocking
        tx.publish(7);
    }

    #[test]
    fn test_frame_survives_producer_drop() {
        let (tx, rx) = frame_sink();
        tx.publish(5);
        drop(tx);
        assert!(!rx.is_producer_alive());
        assert_eq!(rx.try_take(), Some(5));
    }

    #[test]
    fn test_concurrent_producer_never_exceeds_one() {
        let (tx, rx) = frame_sink();
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u32 {
                tx.publish(i);
            }
        });

        let mut last = None;
        while !producer.is_finished() {
            if let Some(v) = rx.try_take() {
                // Most recent wins, so values only move forward
                if let Some(prev) = last {
                    assert!(v > prev);
                }
                last = Some(v);
            }
        }
        producer.join().unwrap();
        if let Some(v) = rx.try_take() {
            last = Some(v);
        }
        assert_eq!(last, Some(9_999));
    }
}
