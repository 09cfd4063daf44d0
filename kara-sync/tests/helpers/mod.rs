//! Test harness for SyncEngine integration tests
//!
//! Provides TestPlayer wrapper with:
//! - Simulated backend with registered instrumental and vocal locations
//! - Event capture from the engine's bus
//! - Probes for moving or stalling either stream behind the engine's back

#![allow(dead_code)]

use kara_common::events::KaraokeEvent;
use kara_sync::media::sim::{SimBackend, SimMedia, SimProbe};
use kara_sync::{Location, SyncEngine, TomlConfig};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const INSTRUMENTAL: &str = "https://cdn.kara.test/songs/1/instrumental.ogg";
pub const VOCALS: &str = "https://cdn.kara.test/songs/1/vocals.ogg";

/// Position comparisons tolerate the float error of the virtual playhead
pub const EPS: f64 = 1e-6;

/// Test wrapper around SyncEngine over the simulated backend
pub struct TestPlayer {
    pub engine: SyncEngine,
    pub backend: SimBackend,
    events: broadcast::Receiver<KaraokeEvent>,
}

impl TestPlayer {
    /// Player with default configuration and no registered media
    pub fn new() -> Self {
        Self::with_config(TomlConfig::default())
    }

    pub fn with_config(config: TomlConfig) -> Self {
        let backend = SimBackend::new();
        let engine = SyncEngine::new(Arc::new(backend.clone()), config).expect("engine construction");
        let events = engine.subscribe_events();
        Self {
            engine,
            backend,
            events,
        }
    }

    /// Player with both stems of a `duration`-second song registered
    pub fn with_song(duration: f64) -> Self {
        let player = Self::new();
        player.register(INSTRUMENTAL, SimMedia::new(duration));
        player.register(VOCALS, SimMedia::new(duration));
        player
    }

    pub fn register(&self, location: &str, media: SimMedia) {
        self.backend.register(location, media);
    }

    /// Load both stems; panics if the load fails
    pub async fn load_song(&self) -> kara_sync::playback::LoadSummary {
        self.engine
            .load_track(INSTRUMENTAL, Some(Location::from(VOCALS)))
            .await
            .expect("song loads")
    }

    /// Load both stems and start playback
    pub async fn play_song(&self) {
        self.load_song().await;
        self.engine.play().await.expect("playback starts");
    }

    pub fn primary(&self) -> SimProbe {
        self.backend.probe(INSTRUMENTAL).expect("instrumental opened")
    }

    pub fn follower(&self) -> SimProbe {
        self.backend.probe(VOCALS).expect("vocals opened")
    }

    /// Every event emitted since the last drain
    pub fn drain_events(&mut self) -> Vec<KaraokeEvent> {
        let mut drained = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => drained.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        drained
    }

    /// Events named `name` since the last drain
    pub fn drain_named(&mut self, name: &str) -> Vec<KaraokeEvent> {
        self.drain_events()
            .into_iter()
            .filter(|event| event.name() == name)
            .collect()
    }
}

/// Advance the paused tokio clock, letting every due task run
pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < EPS,
        "expected {:.6}, got {:.6}",
        expected,
        actual
    );
}
