//! Playback state management

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Loading,
    Ready,
    Playing,
    Paused,
    /// Last load failed on the primary stream
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Stopped => write!(f, "stopped"),
            TransportState::Loading => write!(f, "loading"),
            TransportState::Ready => write!(f, "ready"),
            TransportState::Playing => write!(f, "playing"),
            TransportState::Paused => write!(f, "paused"),
            TransportState::Failed => write!(f, "failed"),
        }
    }
}

/// Authoritative playback state, written only by the transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub rate: f64,
    pub has_follower: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            rate: 1.0,
            has_follower: false,
        }
    }
}

/// Suppresses automatic corrections while a seek settles on both streams
///
/// Loop jumps are recorded here too, so drift correction never fights a jump.
#[derive(Debug, Clone, Default)]
pub struct SeekBarrier {
    pub in_progress: bool,
    pub last_seek_at: Option<Instant>,
    /// Bumped per seek; a settle task only clears the barrier it raised
    pub generation: u64,
}

impl SeekBarrier {
    /// Raise the barrier for a user seek; returns the seek's generation
    pub fn begin(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.in_progress = true;
        self.last_seek_at = Some(now);
        self.generation
    }

    /// Record a position write that should be treated like a seek
    pub fn mark(&mut self, now: Instant) {
        self.last_seek_at = Some(now);
    }

    /// Lower the barrier if no newer seek replaced `generation`
    pub fn finish(&mut self, generation: u64) -> bool {
        if self.generation == generation {
            self.in_progress = false;
            true
        } else {
            false
        }
    }

    /// True while a seek is pending or the last one is younger than `window`
    pub fn is_settling(&self, now: Instant, window: Duration) -> bool {
        self.in_progress
            || self
                .last_seek_at
                .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    /// Drop any pending seek, invalidating outstanding settle tasks
    pub fn reset(&mut self) {
        self.generation += 1;
        self.in_progress = false;
        self.last_seek_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(120);

    #[test]
    fn test_playback_state_defaults() {
        let state = PlaybackState::default();
        assert!(!state.is_playing);
        assert_eq!(state.rate, 1.0);
        assert!(!state.has_follower);
    }

    #[test]
    fn test_transport_state_display() {
        assert_eq!(TransportState::Playing.to_string(), "playing");
        assert_eq!(TransportState::Failed.to_string(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_window() {
        let mut barrier = SeekBarrier::default();
        assert!(!barrier.is_settling(Instant::now(), WINDOW));

        let generation = barrier.begin(Instant::now());
        assert!(barrier.is_settling(Instant::now(), WINDOW));

        tokio::time::advance(Duration::from_millis(200)).await;
        // Still pending until the settle task lowers it
        assert!(barrier.is_settling(Instant::now(), WINDOW));
        assert!(barrier.finish(generation));
        assert!(!barrier.is_settling(Instant::now(), WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_settle_does_not_clear_newer_seek() {
        let mut barrier = SeekBarrier::default();
        let first = barrier.begin(Instant::now());
        let second = barrier.begin(Instant::now());

        assert!(!barrier.finish(first));
        assert!(barrier.in_progress);
        assert!(barrier.finish(second));
        assert!(!barrier.in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_only_opens_window() {
        let mut barrier = SeekBarrier::default();
        barrier.mark(Instant::now());
        assert!(!barrier.in_progress);
        assert!(barrier.is_settling(Instant::now(), WINDOW));

        tokio::time::advance(WINDOW).await;
        assert!(!barrier.is_settling(Instant::now(), WINDOW));
    }
}
