//! Event types for the karaoke transport event system
//!
//! Provides the shared event definitions and the per-engine EventBus consumed by
//! UI, lyrics and video collaborators.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Karaoke transport event types
///
/// Events are broadcast via EventBus and can be serialized for transmission to
/// out-of-process collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KaraokeEvent {
    /// A track finished attaching and is ready to play
    TrackLoaded {
        track_id: Uuid,
        /// Track duration in seconds
        duration: f64,
        /// Whether the vocal follower stream attached
        has_follower: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback started, paused or stopped
    ///
    /// Triggers:
    /// - UI: Update transport controls
    /// - Lyrics Display: Freeze or resume highlighting
    PlaybackStateChanged {
        is_playing: bool,
        /// Primary position at the moment of the change, seconds
        time: f64,
        /// Track duration, seconds
        duration: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// User seek applied to the primary (and mirrored to the follower)
    Seeked {
        time: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback rate changed (already clamped)
    RateChanged {
        rate: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Loop region armed
    LoopSet {
        start: f64,
        end: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Loop region cleared
    LoopCleared {
        /// Position after any post-clear nudge, seconds
        time: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback reached the loop end and jumped back to its start
    LoopCompleted {
        previous_time: f64,
        new_time: f64,
        start: f64,
        end: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Primary and follower both reached end of stream (fires once per track)
    BothStreamsEnded {
        track_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Vocal stream could not be attached; playback continues primary-only
    ///
    /// Triggers:
    /// - UI: Show a non-blocking "vocals unavailable" notice
    FollowerUnavailable {
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl KaraokeEvent {
    /// Short event name, used for logging
    pub fn name(&self) -> &'static str {
        match self {
            KaraokeEvent::TrackLoaded { .. } => "track-loaded",
            KaraokeEvent::PlaybackStateChanged { .. } => "playback-state-changed",
            KaraokeEvent::Seeked { .. } => "seeked",
            KaraokeEvent::RateChanged { .. } => "rate-changed",
            KaraokeEvent::LoopSet { .. } => "loop-set",
            KaraokeEvent::LoopCleared { .. } => "loop-cleared",
            KaraokeEvent::LoopCompleted { .. } => "loop-completed",
            KaraokeEvent::BothStreamsEnded { .. } => "both-streams-ended",
            KaraokeEvent::FollowerUnavailable { .. } => "follower-unavailable",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Event distribution bus owned by a single engine instance
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
///
/// Each engine constructs its own bus; there is no process-wide instance.
///
/// # Examples
///
/// ```
/// use kara_common::events::{EventBus, KaraokeEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(KaraokeEvent::LoopSet {
///     start: 10.0,
///     end: 20.0,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(KaraokeEvent::LoopSet { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KaraokeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<KaraokeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: KaraokeEvent,
    ) -> Result<usize, broadcast::error::SendError<KaraokeEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: KaraokeEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(10);
        let result = bus.emit(KaraokeEvent::RateChanged {
            rate: 1.5,
            timestamp: chrono::Utc::now(),
        });
        assert!(result.is_err(), "No receivers should report a send error");

        // Lossy emit must not panic either
        bus.emit_lossy(KaraokeEvent::RateChanged {
            rate: 1.5,
            timestamp: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit_lossy(KaraokeEvent::LoopSet {
            start: 1.0,
            end: 2.0,
            timestamp: chrono::Utc::now(),
        });
        bus.emit_lossy(KaraokeEvent::LoopCleared {
            time: 2.03,
            timestamp: chrono::Utc::now(),
        });

        assert_eq!(rx.recv().await.unwrap().name(), "loop-set");
        assert_eq!(rx.recv().await.unwrap().name(), "loop-cleared");
    }

    #[test]
    fn test_subscriber_count_tracks_drops() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);

        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx2);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = KaraokeEvent::LoopCompleted {
            previous_time: 19.995,
            new_time: 10.005,
            start: 10.0,
            end: 20.0,
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "LoopCompleted");
        assert_eq!(json["start"], 10.0);

        let back: KaraokeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "loop-completed");
    }
}
