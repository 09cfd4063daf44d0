//! Core sync engine - construction, track lifecycle and shared plumbing
//!
//! **Responsibilities:**
//! - SyncEngine handle and shared state definition
//! - Track loading and full teardown
//! - Stream snapshots for the satellite periodic tasks

use crate::config::TomlConfig;
use crate::error::{Error, LoadError};
use crate::media::{GraphConnection, MediaBackend, MixGraph, SharedResource};
use crate::playback::attach::{AttachmentPipeline, Track, TrackSource};
use crate::playback::looping::LoopController;
use crate::playback::nudger::SyncNudger;
use crate::playback::publisher::PositionPublisher;
use crate::playback::state::{PlaybackState, SeekBarrier, TransportState};
use kara_common::events::{EventBus, KaraokeEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resources of the loaded track
///
/// Dropping it disconnects both streams from the graph and releases both
/// resource handles, whichever path the drop happens on.
pub(crate) struct LoadedTrack {
    pub(crate) id: Uuid,
    pub(crate) track: Track,
    pub(crate) primary: SharedResource,
    pub(crate) follower: Option<SharedResource>,
    pub(crate) connections: Vec<GraphConnection>,
}

impl Drop for LoadedTrack {
    fn drop(&mut self) {
        for connection in self.connections.drain(..) {
            connection.disconnect();
        }
        self.primary.release();
        if let Some(follower) = &self.follower {
            follower.release();
        }
        debug!("Released resources of track {}", self.id);
    }
}

/// Cheap snapshot of the loaded track's handles, taken without holding locks
#[derive(Clone)]
pub(crate) struct StreamSet {
    pub(crate) id: Uuid,
    pub(crate) duration: f64,
    pub(crate) primary: SharedResource,
    pub(crate) follower: Option<SharedResource>,
}

/// Result of a successful load
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSummary {
    pub track_id: Uuid,
    /// Seconds
    pub duration: f64,
    pub has_follower: bool,
}

pub(crate) struct EngineShared {
    pub(crate) config: TomlConfig,
    pub(crate) events: EventBus,
    pub(crate) pipeline: AttachmentPipeline,
    /// Owned and mutated by the transport only
    pub(crate) graph: Box<dyn MixGraph>,
    pub(crate) track: RwLock<Option<LoadedTrack>>,
    pub(crate) playback: RwLock<PlaybackState>,
    pub(crate) transport_state: RwLock<TransportState>,
    pub(crate) barrier: Mutex<SeekBarrier>,
    /// Bumped on every load and teardown; in-flight work for an older value is discarded
    pub(crate) track_generation: AtomicU64,
    /// Set while play() or the nudger is running the follower start sequence
    pub(crate) follower_starting: AtomicBool,
    pub(crate) looping: LoopController,
    pub(crate) nudger: SyncNudger,
    pub(crate) publisher: PositionPublisher,
}

/// Lock a short, never-awaited critical section
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Karaoke transport engine
///
/// One explicitly constructed instance per player; clones share the same
/// engine. Periodic tasks hold only weak references, so dropping the last
/// clone releases every resource.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) shared: Arc<EngineShared>,
}

/// Weak handle given to periodic tasks
#[derive(Clone)]
pub(crate) struct WeakEngine(Weak<EngineShared>);

impl WeakEngine {
    pub(crate) fn upgrade(&self) -> Option<SyncEngine> {
        self.0.upgrade().map(|shared| SyncEngine { shared })
    }
}

impl SyncEngine {
    /// Create new engine over a media backend
    pub fn new(backend: Arc<dyn MediaBackend>, config: TomlConfig) -> Result<Self, Error> {
        config.validate()?;
        info!("Creating sync engine");

        let events = EventBus::new(256);
        let graph = backend.create_graph()?;
        let pipeline = AttachmentPipeline::new(backend, config.attach.clone());

        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                events,
                pipeline,
                graph,
                track: RwLock::new(None),
                playback: RwLock::new(PlaybackState::default()),
                transport_state: RwLock::new(TransportState::Stopped),
                barrier: Mutex::new(SeekBarrier::default()),
                track_generation: AtomicU64::new(0),
                follower_starting: AtomicBool::new(false),
                looping: LoopController::new(),
                nudger: SyncNudger::new(),
                publisher: PositionPublisher::new(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.shared))
    }

    pub fn config(&self) -> &TomlConfig {
        &self.shared.config
    }

    /// Event bus for every notification except position updates
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<KaraokeEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn emit(&self, event: KaraokeEvent) {
        debug!("Emitting {}", event.name());
        self.shared.events.emit_lossy(event);
    }

    pub(crate) fn track_generation(&self) -> u64 {
        self.shared.track_generation.load(Ordering::SeqCst)
    }

    pub(crate) async fn streams(&self) -> Option<StreamSet> {
        self.shared.track.read().await.as_ref().map(|loaded| StreamSet {
            id: loaded.id,
            duration: loaded.track.duration,
            primary: Arc::clone(&loaded.primary),
            follower: loaded.follower.as_ref().map(Arc::clone),
        })
    }

    /// Load a track from its primary and optional follower locations
    pub async fn load_track(
        &self,
        primary: impl Into<crate::media::Location>,
        follower: Option<crate::media::Location>,
    ) -> Result<LoadSummary, LoadError> {
        let mut source = TrackSource::new(primary);
        source.follower = follower;
        self.load(source).await
    }

    /// Load a track, replacing whatever was loaded before
    ///
    /// The previous track is torn down first. Succeeds once the primary is
    /// ready; a failing follower only downgrades the track to primary-only.
    pub async fn load(&self, source: TrackSource) -> Result<LoadSummary, LoadError> {
        info!("Loading track {}", source.primary);
        let generation = self.teardown().await;
        {
            let mut state = self.shared.transport_state.write().await;
            if self.track_generation() != generation {
                warn!("Load of {} superseded before attaching", source.primary);
                return Err(LoadError::Superseded);
            }
            *state = TransportState::Loading;
        }

        let result = self
            .shared
            .pipeline
            .attach(&source, self.shared.graph.as_ref())
            .await;

        // Teardown bumps the generation before it takes the track lock, so a
        // check made under this guard cannot be overtaken by a stop().
        let mut track = self.shared.track.write().await;
        if self.track_generation() != generation {
            drop(track);
            if let Ok(attachment) = result {
                attachment.release();
            }
            warn!("Load of {} superseded before completion", source.primary);
            return Err(LoadError::Superseded);
        }

        let attachment = match result {
            Ok(attachment) => attachment,
            Err(e) => {
                *self.shared.transport_state.write().await = TransportState::Failed;
                return Err(e);
            }
        };

        let has_follower = attachment.has_follower();
        let duration = attachment.track.duration;
        let track_id = Uuid::new_v4();
        debug!("Installing track {} ({:?})", track_id, attachment.mode);

        if let Some(reason) = attachment.follower_unavailable_reason() {
            self.emit(KaraokeEvent::FollowerUnavailable {
                reason,
                timestamp: chrono::Utc::now(),
            });
        }

        let rate = PlaybackState::default().rate;
        for resource in std::iter::once(&attachment.primary).chain(attachment.follower.as_ref()) {
            resource.set_rate(rate);
            resource.set_position(0.0);
        }

        *track = Some(LoadedTrack {
            id: track_id,
            track: attachment.track,
            primary: attachment.primary,
            follower: attachment.follower,
            connections: attachment.connections,
        });
        *self.shared.playback.write().await = PlaybackState {
            is_playing: false,
            rate,
            has_follower,
        };
        *self.shared.transport_state.write().await = TransportState::Ready;
        drop(track);

        info!(
            "Track {} ready: duration={:.3}s has_follower={}",
            track_id, duration, has_follower
        );
        self.emit(KaraokeEvent::TrackLoaded {
            track_id,
            duration,
            has_follower,
            timestamp: chrono::Utc::now(),
        });

        Ok(LoadSummary {
            track_id,
            duration,
            has_follower,
        })
    }

    /// Stop every satellite task and release the loaded track
    ///
    /// Idempotent. Returns the new track generation.
    pub(crate) async fn teardown(&self) -> u64 {
        let generation = self.shared.track_generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.shared.looping.reset();
        self.shared.nudger.stop();
        self.shared.publisher.halt();
        lock(&self.shared.barrier).reset();

        let previous = self.shared.track.write().await.take();
        if let Some(loaded) = previous {
            for resource in std::iter::once(&loaded.primary).chain(loaded.follower.as_ref()) {
                resource.pause();
                resource.set_position(0.0);
            }
            info!("Tearing down track {}", loaded.id);
            drop(loaded);
        }

        *self.shared.playback.write().await = PlaybackState::default();
        generation
    }
}
