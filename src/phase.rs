#![forbid(unsafe_code)]

use std::fmt::Display;

use tracing::{debug, info, warn};

/// Lifecycle of a single media request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Resolving,
    Streaming,
    Completed,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn permits(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Resolving)
                | (Self::Resolving, Self::Streaming)
                | (Self::Streaming, Self::Completed)
                | (Self::Idle | Self::Resolving | Self::Streaming, Self::Failed)
        )
    }
}

/// Follows one request through its phases and logs each step.
///
/// Dropped while still `Streaming` means the client went away before the
/// body finished.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: RequestPhase,
    bytes_sent: u64,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: RequestPhase::Idle,
            bytes_sent: 0,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Returns false (and leaves the phase alone) on an illegal transition.
    pub fn advance(&mut self, next: RequestPhase) -> bool {
        if !self.phase.permits(next) {
            warn!(from = ?self.phase, to = ?next, "ignoring illegal phase transition");
            return false;
        }
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        true
    }

    pub fn record_bytes(&mut self, count: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(count as u64);
    }

    pub fn complete(&mut self) {
        if self.advance(RequestPhase::Completed) {
            info!(bytes = self.bytes_sent, "stream completed");
        }
    }

    pub fn fail(&mut self, reason: &dyn Display) {
        let was_streaming = self.phase == RequestPhase::Streaming;
        if self.advance(RequestPhase::Failed) {
            warn!(
                error = %reason,
                bytes = self.bytes_sent,
                mid_stream = was_streaming,
                "request failed"
            );
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PhaseTracker {
    fn drop(&mut self) {
        if self.phase == RequestPhase::Streaming {
            info!(bytes = self.bytes_sent, "client disconnected mid-stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_completed() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.advance(RequestPhase::Resolving));
        assert!(tracker.advance(RequestPhase::Streaming));
        tracker.record_bytes(10);
        tracker.complete();
        assert_eq!(tracker.phase(), RequestPhase::Completed);
        assert_eq!(tracker.bytes_sent(), 10);
        assert!(tracker.phase().is_terminal());
    }

    #[test]
    fn cannot_skip_or_go_back() {
        let mut tracker = PhaseTracker::new();
        assert!(!tracker.advance(RequestPhase::Streaming));
        assert_eq!(tracker.phase(), RequestPhase::Idle);
        tracker.advance(RequestPhase::Resolving);
        assert!(!tracker.advance(RequestPhase::Idle));
        assert!(!tracker.advance(RequestPhase::Completed));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(RequestPhase::Resolving);
        tracker.fail(&"resolver exploded");
        assert_eq!(tracker.phase(), RequestPhase::Failed);
        assert!(!tracker.advance(RequestPhase::Streaming));
        tracker.fail(&"again");
        assert_eq!(tracker.phase(), RequestPhase::Failed);
    }
}
