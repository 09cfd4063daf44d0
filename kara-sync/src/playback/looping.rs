//! Fixed-region looping
//!
//! A boundary-check task runs every loop tick while a region is active. Each
//! task is tagged with the region generation it was started for; any check
//! whose captured generation differs from the live one does nothing. That
//! comparison, not task cancellation, is what keeps a check scheduled under an
//! old region from acting on a new or cleared one.

use crate::error::InvalidLoopRegion;
use crate::media::SharedResource;
use crate::playback::engine::{lock, SyncEngine};
use kara_common::events::KaraokeEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Active loop bounds on the primary's timeline, seconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
    pub active: bool,
    pub generation: u64,
}

/// One executed jump-back
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopJump {
    pub previous_time: f64,
    pub new_time: f64,
    pub start: f64,
    pub end: f64,
}

#[derive(Default)]
struct LoopInner {
    region: LoopRegion,
    last_jump_at: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl LoopInner {
    fn cooling_down(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_jump_at
            .is_some_and(|at| now.saturating_duration_since(at) < cooldown)
    }
}

pub(crate) struct LoopController {
    inner: Mutex<LoopInner>,
    jump_in_flight: AtomicBool,
}

impl LoopController {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LoopInner::default()),
            jump_in_flight: AtomicBool::new(false),
        }
    }

    pub(crate) fn region(&self) -> LoopRegion {
        lock(&self.inner).region
    }

    /// Run `apply` and record the jump, unless the region moved on or another
    /// jump landed inside the cooldown since the caller looked
    fn commit_jump(&self, generation: u64, now: Instant, cooldown: Duration, apply: impl FnOnce()) -> bool {
        let mut inner = lock(&self.inner);
        if inner.region.generation != generation || !inner.region.active {
            return false;
        }
        if inner.cooling_down(now, cooldown) {
            trace!("Loop jump already taken for this crossing");
            return false;
        }
        apply();
        inner.last_jump_at = Some(now);
        true
    }

    /// Deactivate and invalidate every outstanding check
    pub(crate) fn reset(&self) {
        let mut inner = lock(&self.inner);
        let generation = inner.region.generation + 1;
        inner.region = LoopRegion {
            generation,
            ..LoopRegion::default()
        };
        inner.last_jump_at = None;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        self.jump_in_flight.store(false, Ordering::SeqCst);
    }
}

/// True when `resource` ran to its end and stopped there
fn stopped_at_end(resource: &SharedResource, track_duration: f64, epsilon: f64) -> bool {
    if !resource.is_paused() {
        return false;
    }
    match resource.ended() {
        Some(ended) => ended,
        None => resource.position() >= resource.duration().unwrap_or(track_duration) - epsilon,
    }
}

/// Validate requested bounds and clamp them to `[0, duration]`
pub fn clamp_loop_bounds(start: f64, end: f64, duration: f64) -> Result<(f64, f64), InvalidLoopRegion> {
    if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
        return Err(InvalidLoopRegion { start, end });
    }
    let clamped_start = start.clamp(0.0, duration.max(0.0));
    let clamped_end = end.clamp(0.0, duration.max(0.0));
    if clamped_end <= clamped_start {
        return Err(InvalidLoopRegion { start, end });
    }
    Ok((clamped_start, clamped_end))
}

impl SyncEngine {
    /// Arm a loop region; returns false (and changes nothing) for invalid bounds
    pub async fn set_loop(&self, start: f64, end: f64) -> bool {
        let duration = self.duration().await;
        let (start, end) = match clamp_loop_bounds(start, end, duration) {
            Ok(bounds) => bounds,
            Err(e) => {
                debug!("{} (duration {})", e, duration);
                return false;
            }
        };

        let looping = &self.shared.looping;
        let generation = {
            let mut inner = lock(&looping.inner);
            let generation = inner.region.generation + 1;
            inner.region = LoopRegion {
                start,
                end,
                active: true,
                generation,
            };
            inner.last_jump_at = None;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            looping.jump_in_flight.store(false, Ordering::SeqCst);
            generation
        };

        let task = self.spawn_loop_checks(generation);
        {
            let mut inner = lock(&looping.inner);
            if inner.region.generation == generation {
                inner.task = Some(task);
            } else {
                // Region changed while spawning
                task.abort();
            }
        }

        info!("Loop set [{:.3}, {:.3}] (generation {})", start, end, generation);
        self.emit(KaraokeEvent::LoopSet {
            start,
            end,
            timestamp: chrono::Utc::now(),
        });
        true
    }

    fn spawn_loop_checks(&self, generation: u64) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.shared.config.sync.loop_tick();
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if engine.shared.looping.region().generation != generation {
                    break;
                }
                engine.check_loop_boundary(generation).await;
            }
            trace!("Loop check task for generation {} exited", generation);
        })
    }

    /// Run one boundary check as the periodic task captured at `generation`
    ///
    /// Returns the jump performed, if any.
    pub async fn check_loop_boundary(&self, generation: u64) -> Option<LoopJump> {
        let streams = self.streams().await?;
        let is_playing = self.shared.playback.read().await.is_playing;

        let looping = &self.shared.looping;
        let tuning = &self.shared.config.sync;
        let now = Instant::now();

        let region = {
            let inner = lock(&looping.inner);
            if inner.region.generation != generation {
                trace!("Stale loop check (captured {}, live {})", generation, inner.region.generation);
                return None;
            }
            if !inner.region.active || !is_playing {
                return None;
            }
            if inner.cooling_down(now, tuning.jump_cooldown()) {
                return None;
            }
            inner.region
        };

        if lock(&self.shared.barrier).is_settling(now, tuning.settle_window()) {
            return None;
        }

        // A region ending at the track's end is crossed by the primary ending
        let position = streams.primary.position();
        let primary_ended = streams.primary.ended() == Some(true);
        if position < region.end - tuning.loop_end_epsilon && !primary_ended {
            return None;
        }

        if looping.jump_in_flight.swap(true, Ordering::SeqCst) {
            return None;
        }

        let restart_primary = stopped_at_end(&streams.primary, streams.duration, tuning.end_epsilon);
        let restart_follower = streams
            .follower
            .as_ref()
            .filter(|follower| stopped_at_end(follower, streams.duration, tuning.end_epsilon));

        let new_time = (region.start + tuning.jump_offset).max(0.0);
        let jump_at = Instant::now();
        let committed = looping.commit_jump(generation, jump_at, tuning.jump_cooldown(), || {
            streams.primary.set_position(new_time);
            if let Some(follower) = &streams.follower {
                follower.set_position(new_time);
            }
            lock(&self.shared.barrier).mark(jump_at);
        });
        looping.jump_in_flight.store(false, Ordering::SeqCst);
        if !committed {
            return None;
        }

        if restart_primary {
            if let Err(e) = streams.primary.play().await {
                warn!("Primary did not restart after loop jump: {}", e);
            }
        }
        if let Some(follower) = restart_follower {
            if let Err(e) = follower.play().await {
                // The drift corrector re-attaches it
                warn!("Follower did not restart after loop jump: {}", e);
            }
        }

        debug!("Loop jump {:.3}s -> {:.3}s", position, new_time);
        self.emit(KaraokeEvent::LoopCompleted {
            previous_time: position,
            new_time,
            start: region.start,
            end: region.end,
            timestamp: chrono::Utc::now(),
        });

        Some(LoopJump {
            previous_time: position,
            new_time,
            start: region.start,
            end: region.end,
        })
    }

    /// Clear the loop region; returns false if no loop was active
    ///
    /// If playback sits inside the cleared region it is moved just past the
    /// region's end, so it does not resume mid-phrase.
    pub async fn clear_loop(&self) -> bool {
        let looping = &self.shared.looping;
        let cleared = {
            let mut inner = lock(&looping.inner);
            let cleared = inner.region;
            inner.region = LoopRegion {
                generation: cleared.generation + 1,
                ..LoopRegion::default()
            };
            inner.last_jump_at = None;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            cleared
        };

        if !cleared.active {
            return false;
        }

        let tuning = &self.shared.config.sync;
        let mut time = 0.0;
        if let Some(streams) = self.streams().await {
            let position = streams.primary.position();
            time = position;

            let inside = (position >= cleared.start && position < cleared.end)
                || (position - cleared.start).abs() <= tuning.clear_start_proximity;
            if inside {
                let target = (cleared.end + tuning.clear_resume_offset)
                    .min(streams.duration - tuning.clear_tail_margin)
                    .max(0.0);
                streams.primary.set_position(target);
                if let Some(follower) = &streams.follower {
                    follower.set_position(target);
                }
                lock(&self.shared.barrier).mark(Instant::now());
                debug!("Moved playback from {:.3}s to {:.3}s after clearing loop", position, target);
                time = target;
            }
        }

        info!("Loop cleared (generation {})", cleared.generation + 1);
        self.emit(KaraokeEvent::LoopCleared {
            time,
            timestamp: chrono::Utc::now(),
        });
        true
    }

    /// Snapshot of the current loop region
    pub fn loop_region(&self) -> LoopRegion {
        self.shared.looping.region()
    }
}
