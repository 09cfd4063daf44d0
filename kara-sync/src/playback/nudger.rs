//! Follower drift correction
//!
//! While playing, the follower is measured against the primary every sync tick
//! and snapped back when it wanders past the drift threshold. A follower that
//! silently stopped while the primary keeps playing gets one bounded
//! re-attachment attempt per tick.

use crate::playback::attach::AttachmentPipeline;
use crate::playback::engine::{lock, StreamSet, SyncEngine};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Drift measured on one tick; positive means the follower is ahead
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncMeasurement {
    pub drift: f64,
}

/// What one sync tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAction {
    /// Not playing, or no follower attached
    Idle,
    /// Inside the settle window after a seek or loop jump
    Settling,
    InSync(SyncMeasurement),
    /// Follower snapped to `primary + drift_bias`
    Corrected(SyncMeasurement),
    /// Follower was stalled; `true` when it started again
    Reattached(bool),
}

pub(crate) struct SyncNudger {
    generation: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncNudger {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl SyncEngine {
    pub(crate) fn start_nudger(&self) {
        let nudger = &self.shared.nudger;
        nudger.stop();
        let generation = nudger.generation.load(Ordering::SeqCst);

        let weak = self.downgrade();
        let period = self.shared.config.sync.sync_tick();
        let task = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; give play() a period to settle
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if engine.shared.nudger.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                engine.sync_tick().await;
            }
            trace!("Sync task {} exited", generation);
        });
        *lock(&nudger.task) = Some(task);
    }

    /// True while the periodic drift corrector is scheduled
    pub fn is_syncing(&self) -> bool {
        self.shared.nudger.is_running()
    }

    /// Run one drift-correction pass
    pub async fn sync_tick(&self) -> SyncAction {
        if !self.shared.playback.read().await.is_playing {
            return SyncAction::Idle;
        }
        let Some(streams) = self.streams().await else {
            return SyncAction::Idle;
        };
        let Some(follower) = &streams.follower else {
            return SyncAction::Idle;
        };

        let tuning = &self.shared.config.sync;
        if lock(&self.shared.barrier).is_settling(Instant::now(), tuning.settle_window()) {
            return SyncAction::Settling;
        }

        let follower_finished = follower.ended() == Some(true);
        if !streams.primary.is_paused() && follower.is_paused() && !follower_finished {
            return SyncAction::Reattached(self.reattach_follower(&streams).await);
        }

        let primary_position = streams.primary.position();
        let measurement = SyncMeasurement {
            drift: follower.position() - primary_position,
        };

        if measurement.drift.abs() > tuning.drift_threshold {
            let target = primary_position + tuning.drift_bias;
            debug!("Drift {:+.3}s, moving follower to {:.3}s", measurement.drift, target);
            follower.set_position(target);
            SyncAction::Corrected(measurement)
        } else {
            trace!("Drift {:+.3}s within threshold", measurement.drift);
            SyncAction::InSync(measurement)
        }
    }

    async fn reattach_follower(&self, streams: &StreamSet) -> bool {
        let Some(follower) = &streams.follower else {
            return false;
        };
        if self
            .shared
            .follower_starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let generation = self.track_generation();
        let rate = self.shared.playback.read().await.rate;
        info!("Follower stalled while primary plays, re-attaching");
        let result = AttachmentPipeline::start_follower(
            follower,
            &streams.primary,
            rate,
            &self.shared.config.retry.reattach,
        )
        .await;
        self.shared.follower_starting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let still_playing = self.shared.playback.read().await.is_playing;
                if self.track_generation() != generation || !still_playing {
                    follower.pause();
                    return false;
                }
                true
            }
            Err(e) => {
                warn!("Follower re-attachment failed: {}", e);
                false
            }
        }
    }
}
