//! Frames waiting for the consumer and the session counters

use std::collections::VecDeque;

use metrics::counter;

use crate::capture::frame::Payload;

/// An accepted frame that has not been read yet
pub(crate) struct PendingFrame {
    pub payload: Payload,
    pub capture_time_us: i64,
}

/// Accepted frames in arrival order together with their presentation times.
///
/// Both sequences are only ever changed together, so they always have the
/// same length.
#[derive(Default)]
pub(crate) struct PendingQueue {
    frames: VecDeque<PendingFrame>,
    times: VecDeque<i64>,
}

impl PendingQueue {
    pub fn push(&mut self, payload: Payload, capture_time_us: i64, presentation_time_us: i64) {
        self.frames.push_back(PendingFrame {
            payload,
            capture_time_us,
        });
        self.times.push_back(presentation_time_us);
        debug_assert_eq!(self.frames.len(), self.times.len());
    }

    /// Oldest frame and its presentation time
    pub fn pop(&mut self) -> Option<(PendingFrame, i64)> {
        let frame = self.frames.pop_front()?;
        let time = self.times.pop_front()?;
        Some((frame, time))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Counters for one capture session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Every frame the device delivered during the session
    pub received: u64,
    /// Frames the consumer read and returned
    pub encoded: u64,
    /// Frames rejected, timed out or discarded at stop
    pub dropped: u64,
    pub glitches: u64,
    pub first_frame_time_us: i64,
    pub last_frame_time_us: i64,
}

impl Statistics {
    pub(crate) fn record_received(&mut self) {
        self.received += 1;
        counter!("camsource.frames_received").increment(1);
    }

    pub(crate) fn record_encoded(&mut self) {
        self.encoded += 1;
        counter!("camsource.frames_encoded").increment(1);
    }

    pub(crate) fn record_dropped(&mut self) {
        self.dropped += 1;
        counter!("camsource.frames_dropped").increment(1);
    }

    /// `received == encoded + dropped`
    pub fn is_balanced(&self) -> bool {
        self.received == self.encoded + self.dropped
    }

    /// Frames neither returned nor dropped yet
    pub fn outstanding(&self) -> u64 {
        self.received.saturating_sub(self.encoded + self.dropped)
    }

    pub fn recorded_duration_us(&self) -> i64 {
        self.last_frame_time_us.saturating_sub(self.first_frame_time_us)
    }
}
