//! Per-frame admission: start/stop times, monotonic timestamps, glitches

use metrics::counter;
use tracing::{trace, warn};

use crate::utils::frame_interval_us;

/// Why the gate refused a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The session is not running
    NotStarted,
    /// Captured before the requested start time
    BeforeStart,
    /// Refused by the installed [`FrameSkipPolicy`]
    Policy,
    /// Not later than the last accepted frame
    NonMonotonic,
}

/// Outcome of [`FrameTimingGate::should_skip`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept { presentation_time_us: i64 },
    Drop(DropReason),
    /// Stop time reached; the frame is dropped and the stream is over
    EndOfStream,
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept { .. })
    }
}

/// Source-specific frame skipping, consulted after the stop-time check
pub trait FrameSkipPolicy: Send {
    fn skip_frame(&mut self, timestamp_us: i64) -> bool;

    /// Interval between captured frames when it differs from the frame rate
    fn capture_interval_us(&self) -> Option<i64> {
        None
    }
}

/// Keeps one frame per capture interval
#[derive(Debug, Clone)]
pub struct TimeLapsePolicy {
    capture_interval_us: i64,
    last_kept_us: Option<i64>,
}

impl TimeLapsePolicy {
    pub fn new(capture_interval_us: i64) -> Self {
        Self {
            capture_interval_us,
            last_kept_us: None,
        }
    }
}

impl FrameSkipPolicy for TimeLapsePolicy {
    fn skip_frame(&mut self, timestamp_us: i64) -> bool {
        match self.last_kept_us {
            Some(last) if timestamp_us < last.saturating_add(self.capture_interval_us) => true,
            _ => {
                self.last_kept_us = Some(timestamp_us);
                false
            }
        }
    }

    fn capture_interval_us(&self) -> Option<i64> {
        Some(self.capture_interval_us)
    }
}

/// Decides whether each incoming frame is accepted, dropped or ends the stream
pub struct FrameTimingGate {
    /// Requested start time until the first frame, then the presentation origin
    start_time_us: i64,
    stop_time_us: Option<i64>,
    last_timestamp_us: i64,
    first_frame_time_us: i64,
    frames_accepted: u64,
    glitch_threshold_us: i64,
    glitches: u64,
    eos: bool,
    skip_policy: Option<Box<dyn FrameSkipPolicy>>,
}

impl FrameTimingGate {
    pub fn new(start_time_us: i64, glitch_threshold_us: i64) -> Self {
        Self {
            start_time_us,
            stop_time_us: None,
            last_timestamp_us: 0,
            first_frame_time_us: 0,
            frames_accepted: 0,
            glitch_threshold_us,
            glitches: 0,
            eos: false,
            skip_policy: None,
        }
    }

    /// Glitch threshold for a frame rate: one frame interval, never below `floor_us`
    pub fn glitch_threshold_for(frame_rate: u32, floor_us: i64) -> i64 {
        if frame_rate == 0 {
            return floor_us;
        }
        floor_us.max(frame_interval_us(frame_rate))
    }

    /// Start a new session. The stop time and skip policy carry over.
    pub fn restart(&mut self, start_time_us: i64, glitch_threshold_us: i64) {
        self.start_time_us = start_time_us;
        self.glitch_threshold_us = glitch_threshold_us;
        self.last_timestamp_us = 0;
        self.first_frame_time_us = 0;
        self.frames_accepted = 0;
        self.glitches = 0;
        self.eos = false;
    }

    pub fn set_stop_time_us(&mut self, stop_time_us: Option<i64>) {
        self.stop_time_us = stop_time_us;
    }

    pub fn stop_time_us(&self) -> Option<i64> {
        self.stop_time_us
    }

    pub fn set_skip_policy(&mut self, policy: Option<Box<dyn FrameSkipPolicy>>) {
        self.skip_policy = policy;
    }

    pub fn capture_interval_us(&self) -> Option<i64> {
        self.skip_policy
            .as_ref()
            .and_then(|policy| policy.capture_interval_us())
    }

    pub fn should_skip(&mut self, timestamp_us: i64, started: bool) -> GateDecision {
        if !started {
            return GateDecision::Drop(DropReason::NotStarted);
        }
        if self.frames_accepted == 0 && timestamp_us < self.start_time_us {
            return GateDecision::Drop(DropReason::BeforeStart);
        }

        if let Some(stop) = self.stop_time_us {
            if timestamp_us >= stop {
                if !self.eos {
                    trace!("Stop time {} reached at {}", stop, timestamp_us);
                }
                self.eos = true;
                return GateDecision::EndOfStream;
            }
        }

        if let Some(policy) = self.skip_policy.as_mut() {
            if policy.skip_frame(timestamp_us) {
                return GateDecision::Drop(DropReason::Policy);
            }
        }

        if self.frames_accepted > 0 {
            if timestamp_us <= self.last_timestamp_us {
                warn!(
                    "Dropping frame with backward timestamp {} (last {})",
                    timestamp_us, self.last_timestamp_us
                );
                return GateDecision::Drop(DropReason::NonMonotonic);
            }
            if timestamp_us.saturating_sub(self.last_timestamp_us) > self.glitch_threshold_us {
                self.glitches += 1;
                counter!("camsource.glitches").increment(1);
            }
        }

        self.last_timestamp_us = timestamp_us;
        if self.frames_accepted == 0 {
            self.first_frame_time_us = timestamp_us;
            // Initial delay
            if self.start_time_us > 0 {
                if timestamp_us < self.start_time_us {
                    return GateDecision::Drop(DropReason::BeforeStart);
                }
                self.start_time_us = timestamp_us - self.start_time_us;
            }
        }

        self.frames_accepted += 1;
        GateDecision::Accept {
            presentation_time_us: self
                .start_time_us
                .saturating_add(timestamp_us.saturating_sub(self.first_frame_time_us)),
        }
    }

    pub fn eos(&self) -> bool {
        self.eos
    }

    pub fn glitches(&self) -> u64 {
        self.glitches
    }

    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted
    }

    pub fn first_frame_time_us(&self) -> i64 {
        self.first_frame_time_us
    }

    pub fn last_timestamp_us(&self) -> i64 {
        self.last_timestamp_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn accepted(gate: &mut FrameTimingGate, timestamps: &[i64]) -> Vec<(i64, i64)> {
        timestamps
            .iter()
            .filter_map(|&ts| match gate.should_skip(ts, true) {
                GateDecision::Accept {
                    presentation_time_us,
                } => Some((ts, presentation_time_us)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_drops_non_increasing() {
        let mut gate = FrameTimingGate::new(0, 200_000);
        let kept = accepted(&mut gate, &[100, 100, 150, 140, 300]);
        let captured: Vec<i64> = kept.iter().map(|&(ts, _)| ts).collect();
        assert_eq!(captured, vec![100, 150, 300]);

        // Origin is the first frame when no start time is given
        let presented: Vec<i64> = kept.iter().map(|&(_, pt)| pt).collect();
        assert_eq!(presented, vec![0, 50, 200]);
    }

    #[test]
    fn test_not_started() {
        let mut gate = FrameTimingGate::new(0, 200_000);
        assert_eq!(
            gate.should_skip(100, false),
            GateDecision::Drop(DropReason::NotStarted)
        );
        assert_eq!(gate.frames_accepted(), 0);
    }

    #[test]
    fn test_start_time_origin() {
        let mut gate = FrameTimingGate::new(1_000, 200_000);
        assert_eq!(
            gate.should_skip(900, true),
            GateDecision::Drop(DropReason::BeforeStart)
        );
        assert_eq!(
            gate.should_skip(1_500, true),
            GateDecision::Accept {
                presentation_time_us: 500
            }
        );
        assert_eq!(
            gate.should_skip(1_600, true),
            GateDecision::Accept {
                presentation_time_us: 600
            }
        );
    }

    #[test]
    fn test_stop_time_latches_eos() {
        let mut gate = FrameTimingGate::new(0, 200_000);
        gate.set_stop_time_us(Some(500));
        assert!(gate.should_skip(400, true).is_accept());
        assert_eq!(gate.should_skip(600, true), GateDecision::EndOfStream);
        assert!(gate.eos());
    }

    #[test]
    fn test_glitch_counting() {
        let threshold = FrameTimingGate::glitch_threshold_for(30, 200_000);
        assert_eq!(threshold, 200_000);
        assert_eq!(FrameTimingGate::glitch_threshold_for(2, 200_000), 500_000);

        let mut gate = FrameTimingGate::new(0, threshold);
        accepted(&mut gate, &[0, 33_000, 66_000, 400_000, 433_000]);
        assert_eq!(gate.glitches(), 1);
    }

    #[test]
    fn test_time_lapse_policy() {
        let mut gate = FrameTimingGate::new(0, 10_000_000);
        gate.set_skip_policy(Some(Box::new(TimeLapsePolicy::new(1_000))));
        assert_eq!(gate.capture_interval_us(), Some(1_000));

        let kept = accepted(&mut gate, &[0, 300, 600, 1_000, 1_500, 2_100]);
        let captured: Vec<i64> = kept.iter().map(|&(ts, _)| ts).collect();
        assert_eq!(captured, vec![0, 1_000, 2_100]);
    }

    #[test]
    fn test_restart_keeps_stop_time() {
        let mut gate = FrameTimingGate::new(0, 200_000);
        gate.set_stop_time_us(Some(10));
        assert_eq!(gate.should_skip(20, true), GateDecision::EndOfStream);

        gate.restart(0, 200_000);
        assert!(!gate.eos());
        assert_eq!(gate.stop_time_us(), Some(10));
    }

    #[test]
    fn test_extreme_timestamps_saturate() {
        let mut gate = FrameTimingGate::new(i64::MIN, 200_000);
        assert!(matches!(
            gate.should_skip(-4_000_000_000_000_000_000, true),
            GateDecision::Accept { .. }
        ));
        assert!(matches!(
            gate.should_skip(6_000_000_000_000_000_000, true),
            GateDecision::Accept { .. }
        ));
        assert_eq!(gate.glitches(), 1);

        let mut policy = TimeLapsePolicy::new(1_000);
        assert!(!policy.skip_frame(i64::MAX - 10));
        assert!(policy.skip_frame(i64::MAX - 1));
    }

    proptest! {
        #[test]
        fn prop_presentation_strictly_increasing(
            timestamps in proptest::collection::vec(0i64..1_000_000, 1..200),
            start in 0i64..500_000,
        ) {
            let mut gate = FrameTimingGate::new(start, 200_000);
            let kept = accepted(&mut gate, &timestamps);
            for pair in kept.windows(2) {
                prop_assert!(pair[1].0 > pair[0].0);
                prop_assert!(pair[1].1 > pair[0].1);
            }
            prop_assert_eq!(kept.len() as u64, gate.frames_accepted());
        }
    }
}
