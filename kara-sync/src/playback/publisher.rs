//! Position publishing and end-of-track detection
//!
//! **Responsibilities:**
//! - Deliver the primary position to subscribers every position tick
//! - Stop ticking once the last subscriber is gone
//! - Fire `BothStreamsEnded` exactly once per track

use crate::playback::engine::{lock, SyncEngine};
use kara_common::events::KaraokeEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Receiving side of a position subscription
///
/// Dropping it unsubscribes on the next tick; [`SyncEngine::unsubscribe_position`]
/// does so immediately.
pub struct PositionSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<f64>,
}

impl PositionSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next published position in seconds; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<f64> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<f64> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct PublisherInner {
    subscribers: Vec<(u64, mpsc::UnboundedSender<f64>)>,
    next_id: u64,
    /// Set by play(), cleared by teardown
    enabled: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct PositionPublisher {
    inner: Mutex<PublisherInner>,
    ended_fired: AtomicBool,
    end_generation: AtomicU64,
    end_watch: Mutex<Option<(Uuid, JoinHandle<()>)>>,
}

impl PositionPublisher {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PublisherInner::default()),
            ended_fired: AtomicBool::new(false),
            end_generation: AtomicU64::new(0),
            end_watch: Mutex::new(None),
        }
    }

    /// Stop ticking and disarm the end watch; subscribers stay registered
    pub(crate) fn halt(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.enabled = false;
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
        }

        self.end_generation.fetch_add(1, Ordering::SeqCst);
        if let Some((_, task)) = lock(&self.end_watch).take() {
            task.abort();
        }
        self.ended_fired.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Subscribe to periodic position updates
    pub fn subscribe_position(&self) -> PositionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = lock(&self.shared.publisher.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            inner.subscribers.push((id, tx));
            id
        };
        debug!("Position subscriber {} added", id);
        self.ensure_publishing();
        PositionSubscription { id, rx }
    }

    /// Remove a position subscriber; the tick stops with the last one
    pub fn unsubscribe_position(&self, id: u64) {
        let mut inner = lock(&self.shared.publisher.inner);
        inner.subscribers.retain(|(sid, _)| *sid != id);
        if inner.subscribers.is_empty() {
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
                debug!("Last position subscriber gone, publisher stopped");
            }
        }
    }

    pub fn position_subscriber_count(&self) -> usize {
        lock(&self.shared.publisher.inner).subscribers.len()
    }

    /// True while the position tick is scheduled
    pub fn is_publishing(&self) -> bool {
        lock(&self.shared.publisher.inner)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn start_publisher(&self) {
        lock(&self.shared.publisher.inner).enabled = true;
        self.ensure_publishing();
    }

    fn ensure_publishing(&self) {
        let mut inner = lock(&self.shared.publisher.inner);
        if !inner.enabled || inner.subscribers.is_empty() || inner.task.is_some() {
            return;
        }
        inner.generation += 1;
        let generation = inner.generation;

        let weak = self.downgrade();
        let period = self.shared.config.sync.position_tick();
        inner.task = Some(tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let position = engine.current_time().await;

                let mut inner = lock(&engine.shared.publisher.inner);
                if inner.generation != generation {
                    break;
                }
                inner.subscribers.retain(|(_, tx)| tx.send(position).is_ok());
                if inner.subscribers.is_empty() {
                    inner.task = None;
                    debug!("No position subscribers left, publisher stopped");
                    break;
                }
            }
            trace!("Position task {} exited", generation);
        }));
    }

    /// Watch for the end of both streams of `track_id`, once per track
    pub(crate) fn arm_end_watch(&self, track_id: Uuid) {
        let publisher = &self.shared.publisher;
        if publisher.ended_fired.load(Ordering::SeqCst) {
            return;
        }
        let mut watch = lock(&publisher.end_watch);
        if watch
            .as_ref()
            .is_some_and(|(id, task)| *id == track_id && !task.is_finished())
        {
            return;
        }

        let generation = publisher.end_generation.load(Ordering::SeqCst);
        let weak = self.downgrade();
        let tuning = self.shared.config.sync.clone();
        let task = tokio::spawn(async move {
            let mut tick = interval(tuning.position_tick());
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut primary_ended_at: Option<Instant> = None;
            loop {
                tick.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let publisher = &engine.shared.publisher;
                if publisher.end_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let Some(streams) = engine.streams().await.filter(|s| s.id == track_id) else {
                    break;
                };

                // An active loop jumps back from the end instead of finishing
                if engine.shared.looping.region().active {
                    primary_ended_at = None;
                    continue;
                }

                if primary_ended_at.is_none() {
                    let primary = &streams.primary;
                    let ended = match primary.ended() {
                        Some(ended) => ended,
                        None => primary.is_paused() && primary.position() >= streams.duration - tuning.end_epsilon,
                    };
                    if !ended {
                        continue;
                    }
                    debug!("Primary reached end of stream");
                    primary_ended_at = Some(Instant::now());
                }

                let follower_done = match &streams.follower {
                    None => true,
                    Some(follower) => match follower.ended() {
                        Some(ended) => ended || follower.is_released(),
                        // No explicit end signal: judge by readiness
                        None => {
                            let length = follower.duration().unwrap_or(streams.duration);
                            follower.is_paused() || follower.position() >= length - tuning.end_epsilon
                        }
                    },
                };
                let waited_out = primary_ended_at
                    .is_some_and(|at| at.elapsed() >= tuning.end_grace());

                if follower_done || waited_out {
                    if !publisher.ended_fired.swap(true, Ordering::SeqCst) {
                        info!("Both streams ended for track {}", track_id);
                        engine.finish_playback(track_id).await;
                        engine.emit(KaraokeEvent::BothStreamsEnded {
                            track_id,
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    break;
                }
            }
        });

        if let Some((_, previous)) = watch.replace((track_id, task)) {
            previous.abort();
        }
    }
}
