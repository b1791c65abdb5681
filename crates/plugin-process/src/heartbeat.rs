//! Lock-up detection from child heartbeats.

use std::time::{Duration, Instant};

/// Tracks when the child last reported in.
///
/// Time is passed in by the caller so the check is independent of the
/// transport and of the wall clock.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_beat: Option<Instant>,
    beats: u64,
    paused: bool,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_beat: None,
            beats: 0,
            paused: false,
        }
    }

    /// Begin watching. Counts as a beat so the child gets a full timeout.
    pub fn start(&mut self, now: Instant) {
        self.last_beat = Some(now);
        self.beats = 0;
    }

    pub fn beat(&mut self, now: Instant) {
        self.last_beat = Some(now);
        self.beats += 1;
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Suspend detection, e.g. while the child waits on a blocking request.
    /// Resuming restarts the timeout from `now`.
    pub fn set_paused(&mut self, paused: bool, now: Instant) {
        if self.paused && !paused && self.last_beat.is_some() {
            self.last_beat = Some(now);
        }
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_locked_up(&self, now: Instant) -> bool {
        if self.paused {
            return false;
        }
        match self.last_beat {
            Some(last) => now.saturating_duration_since(last) > self.timeout,
            None => false,
        }
    }
}
