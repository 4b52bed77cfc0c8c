//! Event batching layer
//!
//! Workers push direction-tagged frame events at whatever rate the bus
//! delivers them; the presentation side drains everything buffered so far in
//! one batch on a fixed cadence. Nothing is ever dropped here.

use crate::types::{Direction, Frame, FrameEvent};
use std::time::{Duration, Instant};

/// Unbounded buffer of frame events drained on a fixed cadence
#[derive(Debug)]
pub struct EventBatcher {
    pending: Vec<FrameEvent>,
    flush_interval: Duration,
    last_flush: Instant,
    total_events: u64,
}

impl EventBatcher {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            flush_interval,
            last_flush: Instant::now(),
            total_events: 0,
        }
    }

    pub fn push(&mut self, direction: Direction, frame: Frame) {
        self.pending.push(FrameEvent { direction, frame });
        self.total_events += 1;
    }

    /// Drain every buffered event as one batch
    pub fn flush(&mut self) -> Vec<FrameEvent> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending)
    }

    /// Drain the buffer only if a flush interval has elapsed since the last one
    pub fn flush_if_due(&mut self, now: Instant) -> Option<Vec<FrameEvent>> {
        if now.saturating_duration_since(self.last_flush) < self.flush_interval {
            return None;
        }
        self.last_flush = now;
        Some(std::mem::take(&mut self.pending))
    }

    /// Time until the next flush is due
    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.flush_interval
            .saturating_sub(now.saturating_duration_since(self.last_flush))
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Events accepted since creation or the last clear
    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.total_events = 0;
    }
}

impl Default for EventBatcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> Frame {
        Frame::new(0.0, id, vec![0x01]).unwrap()
    }

    #[test]
    fn test_flush_drains_in_order() {
        let mut batcher = EventBatcher::default();
        for id in 0..500u32 {
            batcher.push(Direction::Rx, frame(id));
        }
        batcher.push(Direction::Tx, frame(0x7FF));

        let batch = batcher.flush();
        assert_eq!(batch.len(), 501);
        assert!(batch[..500]
            .iter()
            .enumerate()
            .all(|(i, e)| e.frame.identifier() == i as u32 && e.direction == Direction::Rx));
        assert_eq!(batch[500].direction, Direction::Tx);
        assert_eq!(batcher.pending(), 0);
        assert!(batcher.flush().is_empty());
        assert_eq!(batcher.total_events(), 501);
    }

    #[test]
    fn test_flush_cadence() {
        let mut batcher = EventBatcher::new(Duration::from_millis(100));
        let start = Instant::now();
        batcher.push(Direction::Rx, frame(1));

        assert!(batcher.flush_if_due(start).is_none());
        let batch = batcher
            .flush_if_due(start + Duration::from_millis(150))
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batcher
            .flush_if_due(start + Duration::from_millis(200))
            .is_none());
        assert_eq!(
            batcher.time_until_due(start + Duration::from_millis(200)),
            Duration::from_millis(50)
        );
    }
}
