//! Transport control methods for SyncEngine
//!
//! **Responsibilities:**
//! - Playback state transitions (play, pause, stop)
//! - Seek with settle barrier
//! - Playback rate
//! - Position and state accessors

use super::core::{lock, SyncEngine};
use crate::error::PlaybackError;
use crate::playback::attach::AttachmentPipeline;
use crate::playback::state::{PlaybackState, TransportState};
use kara_common::events::KaraokeEvent;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl SyncEngine {
    /// Start or resume playback
    ///
    /// The primary must start; the follower is started under the configured
    /// retry policy and left paused if it keeps refusing (the drift corrector
    /// retries it later).
    pub async fn play(&self) -> Result<(), PlaybackError> {
        info!("Play command received");
        let streams = self.streams().await.ok_or(PlaybackError::NoTrack)?;
        let generation = self.track_generation();

        if self.shared.graph.is_suspended() {
            if let Err(e) = self.shared.graph.resume().await {
                warn!("Mixing graph did not resume: {}", e);
            }
        }

        let rate = self.shared.playback.read().await.rate;
        streams.primary.set_rate(rate);
        streams
            .primary
            .play()
            .await
            .map_err(PlaybackError::PrimaryStartFailed)?;

        if self.track_generation() != generation {
            // Replaced while the primary was starting
            streams.primary.pause();
            return Err(PlaybackError::NoTrack);
        }

        self.shared.playback.write().await.is_playing = true;
        *self.shared.transport_state.write().await = TransportState::Playing;

        self.start_nudger();
        self.start_publisher();
        self.arm_end_watch(streams.id);

        let time = streams.primary.position();
        self.emit(KaraokeEvent::PlaybackStateChanged {
            is_playing: true,
            time,
            duration: streams.duration,
            timestamp: chrono::Utc::now(),
        });

        if let Some(follower) = &streams.follower {
            if self
                .shared
                .follower_starting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Follower start already in progress");
                return Ok(());
            }

            let policy = &self.shared.config.retry.follower_start;
            let result = AttachmentPipeline::start_follower(follower, &streams.primary, rate, policy).await;
            self.shared.follower_starting.store(false, Ordering::SeqCst);

            match result {
                Ok(()) => {
                    let still_playing = self.shared.playback.read().await.is_playing;
                    if self.track_generation() != generation || !still_playing {
                        // Paused or replaced while the follower was retrying
                        follower.pause();
                    }
                }
                Err(e) => warn!("{}; leaving follower paused for the drift corrector", e),
            }
        }

        Ok(())
    }

    /// Pause both streams; no-op without a track
    pub async fn pause(&self) {
        info!("Pause command received");
        self.shared.nudger.stop();

        let Some(streams) = self.streams().await else {
            return;
        };
        streams.primary.pause();
        if let Some(follower) = &streams.follower {
            follower.pause();
        }

        self.shared.playback.write().await.is_playing = false;
        *self.shared.transport_state.write().await = TransportState::Paused;

        self.emit(KaraokeEvent::PlaybackStateChanged {
            is_playing: false,
            time: streams.primary.position(),
            duration: streams.duration,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Stop playback and release every resource of the loaded track
    pub async fn stop(&self) {
        info!("Stop command received");
        let had_track = self.shared.track.read().await.is_some();
        self.teardown().await;
        *self.shared.transport_state.write().await = TransportState::Stopped;

        if had_track {
            self.emit(KaraokeEvent::PlaybackStateChanged {
                is_playing: false,
                time: 0.0,
                duration: 0.0,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Seek both streams to `time` seconds
    ///
    /// The primary is written first. Drift correction and loop checks stay
    /// suppressed until the settle window has passed and the follower has been
    /// re-checked once.
    pub async fn seek(&self, time: f64) {
        if !time.is_finite() {
            warn!("Ignoring seek to non-finite time {}", time);
            return;
        }
        let Some(streams) = self.streams().await else {
            debug!("Seek without a track ignored");
            return;
        };

        let target = time.clamp(0.0, streams.duration);
        let seek_generation = lock(&self.shared.barrier).begin(Instant::now());

        streams.primary.set_position(target);
        if let Some(follower) = &streams.follower {
            follower.set_position(target);
        }
        debug!("Seek to {:.3}s (seek #{})", target, seek_generation);

        self.emit(KaraokeEvent::Seeked {
            time: target,
            timestamp: chrono::Utc::now(),
        });

        let weak = self.downgrade();
        let settle = self.shared.config.sync.settle_window();
        let threshold = self.shared.config.sync.drift_threshold;
        let track_id = streams.id;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(engine) = weak.upgrade() else {
                return;
            };
            if let Some(streams) = engine.streams().await.filter(|s| s.id == track_id) {
                if let Some(follower) = &streams.follower {
                    let primary_position = streams.primary.position();
                    let divergence = follower.position() - primary_position;
                    if divergence.abs() > threshold {
                        debug!("Post-seek divergence {:.3}s, realigning follower", divergence);
                        follower.set_position(primary_position);
                    }
                }
            }
            lock(&engine.shared.barrier).finish(seek_generation);
        });
    }

    /// Set playback rate on both streams; returns the clamped rate applied
    pub async fn set_rate(&self, rate: f64) -> f64 {
        let clamped = self.shared.config.sync.clamp_rate(rate);
        self.shared.playback.write().await.rate = clamped;

        if let Some(streams) = self.streams().await {
            for resource in std::iter::once(&streams.primary).chain(streams.follower.as_ref()) {
                resource.set_rate(clamped);
                if !resource.set_preserves_pitch(true) {
                    debug!("{} stream cannot preserve pitch", resource.role());
                }
            }
        }

        info!("Playback rate set to {}", clamped);
        self.emit(KaraokeEvent::RateChanged {
            rate: clamped,
            timestamp: chrono::Utc::now(),
        });
        clamped
    }

    /// Mark playback finished after both streams ended
    pub(crate) async fn finish_playback(&self, track_id: Uuid) {
        let Some(streams) = self.streams().await.filter(|s| s.id == track_id) else {
            return;
        };
        self.shared.nudger.stop();
        self.shared.playback.write().await.is_playing = false;
        *self.shared.transport_state.write().await = TransportState::Paused;

        self.emit(KaraokeEvent::PlaybackStateChanged {
            is_playing: false,
            time: streams.primary.position(),
            duration: streams.duration,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Current position in seconds, read from the primary
    pub async fn current_time(&self) -> f64 {
        match self.streams().await {
            Some(streams) => streams.primary.position(),
            None => 0.0,
        }
    }

    /// Loaded track duration in seconds, 0 without a track
    pub async fn duration(&self) -> f64 {
        self.shared
            .track
            .read()
            .await
            .as_ref()
            .map_or(0.0, |loaded| loaded.track.duration)
    }

    pub async fn playback_state(&self) -> PlaybackState {
        *self.shared.playback.read().await
    }

    pub async fn transport_state(&self) -> TransportState {
        *self.shared.transport_state.read().await
    }

    pub async fn track_id(&self) -> Option<Uuid> {
        self.shared.track.read().await.as_ref().map(|loaded| loaded.id)
    }

    /// True while a seek or loop jump is still settling
    pub fn is_settling(&self) -> bool {
        lock(&self.shared.barrier).is_settling(Instant::now(), self.shared.config.sync.settle_window())
    }
}
