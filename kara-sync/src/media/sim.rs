//! Simulated media backend
//!
//! Resources advance a virtual playhead on tokio time, so tests running with a
//! paused clock are fully deterministic. Every open resource and graph
//! connection is counted, and faults can be injected per location.

use super::{
    GraphConnection, Location, MediaBackend, MediaResource, MediaSource, MixGraph, ReadyState,
    SharedResource, StreamRole,
};
use crate::error::MediaError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Behaviour of one registered location
#[derive(Debug, Clone)]
pub struct SimMedia {
    pub duration: f64,
    /// Delay from open until metadata is available
    pub metadata_delay: Duration,
    /// Delay from open until enough data is buffered
    pub buffer_delay: Duration,
    pub fail_open: Option<String>,
    pub fail_ready: Option<String>,
    /// Number of leading play() calls that are rejected
    pub play_failures: u32,
    /// Whether the resource reports an explicit end-of-stream
    pub end_signal: bool,
    pub preserves_pitch: bool,
    pub fetchable: bool,
}

impl SimMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            metadata_delay: Duration::from_millis(20),
            buffer_delay: Duration::from_millis(80),
            fail_open: None,
            fail_ready: None,
            play_failures: 0,
            end_signal: true,
            preserves_pitch: true,
            fetchable: true,
        }
    }

    pub fn with_delays(mut self, metadata: Duration, buffer: Duration) -> Self {
        self.metadata_delay = metadata;
        self.buffer_delay = buffer;
        self
    }

    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    pub fn failing_ready(mut self, reason: impl Into<String>) -> Self {
        self.fail_ready = Some(reason.into());
        self
    }

    pub fn with_play_failures(mut self, count: u32) -> Self {
        self.play_failures = count;
        self
    }

    pub fn without_end_signal(mut self) -> Self {
        self.end_signal = false;
        self
    }

    pub fn without_pitch_preservation(mut self) -> Self {
        self.preserves_pitch = false;
        self
    }

    pub fn unfetchable(mut self) -> Self {
        self.fetchable = false;
        self
    }
}

#[derive(Default)]
struct SimShared {
    media: Mutex<HashMap<String, SimMedia>>,
    streams: Mutex<HashMap<String, Arc<SimStream>>>,
    live_resources: AtomicUsize,
    live_connections: AtomicUsize,
    graph_suspended: AtomicBool,
    opened: AtomicUsize,
    fetches: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory backend with handle accounting and fault injection
#[derive(Clone)]
pub struct SimBackend {
    shared: Arc<SimShared>,
}

impl SimBackend {
    pub fn new() -> Self {
        let shared = SimShared::default();
        // Graphs start suspended until the first user gesture resumes them
        shared.graph_suspended.store(true, Ordering::SeqCst);
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Register behaviour for a location
    pub fn register(&self, location: impl Into<String>, media: SimMedia) {
        lock(&self.shared.media).insert(location.into(), media);
    }

    /// Probe the most recently opened stream for a location
    pub fn probe(&self, location: &str) -> Option<SimProbe> {
        lock(&self.shared.streams)
            .get(location)
            .map(|stream| SimProbe {
                stream: Arc::clone(stream),
            })
    }

    /// Resource handles opened and not yet released
    pub fn live_resources(&self) -> usize {
        self.shared.live_resources.load(Ordering::SeqCst)
    }

    /// Graph connections not yet disconnected
    pub fn live_connections(&self) -> usize {
        self.shared.live_connections.load(Ordering::SeqCst)
    }

    pub fn opened_count(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn graph_suspended(&self) -> bool {
        self.shared.graph_suspended.load(Ordering::SeqCst)
    }

    pub fn suspend_graph(&self) {
        self.shared.graph_suspended.store(true, Ordering::SeqCst);
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for SimBackend {
    async fn fetch(&self, location: &Location) -> Result<Vec<u8>, MediaError> {
        self.shared.fetches.fetch_add(1, Ordering::SeqCst);
        let media = lock(&self.shared.media).get(location.as_str()).cloned();
        match media {
            Some(media) if media.fetchable => {
                // Roughly one second of 128kbps audio per second of duration
                let len = (media.duration.max(0.0) * 16_000.0) as usize;
                Ok(vec![0u8; len.min(1 << 20)])
            }
            Some(_) => Err(MediaError::FetchFailed {
                location: location.to_string(),
                reason: "remote refused".to_string(),
            }),
            None => Err(MediaError::FetchFailed {
                location: location.to_string(),
                reason: "nothing at location".to_string(),
            }),
        }
    }

    async fn open(&self, role: StreamRole, source: MediaSource) -> Result<SharedResource, MediaError> {
        let origin = source.origin().clone();
        let media = lock(&self.shared.media)
            .get(origin.as_str())
            .cloned()
            .ok_or_else(|| MediaError::NotFound(origin.to_string()))?;

        if let Some(reason) = &media.fail_open {
            return Err(MediaError::Load(reason.clone()));
        }

        let buffered = matches!(source, MediaSource::Buffered { .. });
        let stream = Arc::new(SimStream::new(media, buffered));
        lock(&self.shared.streams).insert(origin.to_string(), Arc::clone(&stream));
        self.shared.live_resources.fetch_add(1, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!("Sim opened {} stream for {} (buffered={})", role, origin, buffered);

        Ok(Arc::new(SimResource {
            role,
            stream,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn create_graph(&self) -> Result<Box<dyn MixGraph>, MediaError> {
        Ok(Box::new(SimGraph {
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[derive(Debug)]
struct SimClock {
    base: f64,
    anchor: Option<Instant>,
    rate: f64,
    preserves_pitch: bool,
}

struct SimStream {
    media: SimMedia,
    opened_at: Instant,
    buffered: bool,
    clock: Mutex<SimClock>,
    play_failures_left: AtomicU32,
    released: AtomicBool,
}

impl SimStream {
    fn new(media: SimMedia, buffered: bool) -> Self {
        let failures = media.play_failures;
        Self {
            media,
            opened_at: Instant::now(),
            buffered,
            clock: Mutex::new(SimClock {
                base: 0.0,
                anchor: None,
                rate: 1.0,
                preserves_pitch: false,
            }),
            play_failures_left: AtomicU32::new(failures),
            released: AtomicBool::new(false),
        }
    }

    fn position_of(&self, clock: &SimClock) -> f64 {
        let position = match clock.anchor {
            Some(anchor) => clock.base + anchor.elapsed().as_secs_f64() * clock.rate,
            None => clock.base,
        };
        position.min(self.media.duration)
    }

    fn position(&self) -> f64 {
        self.position_of(&lock(&self.clock))
    }

    fn at_end(&self, clock: &SimClock) -> bool {
        self.position_of(clock) >= self.media.duration
    }

    fn is_paused(&self) -> bool {
        let clock = lock(&self.clock);
        clock.anchor.is_none() || self.at_end(&clock)
    }

    fn set_position(&self, seconds: f64) {
        let mut clock = lock(&self.clock);
        // An element that ran to its end stays paused until played again
        let ended = self.at_end(&clock);
        clock.base = seconds.clamp(0.0, self.media.duration);
        clock.anchor = match clock.anchor {
            Some(_) if !ended => Some(Instant::now()),
            _ => None,
        };
    }

    fn pause(&self) {
        let mut clock = lock(&self.clock);
        clock.base = self.position_of(&clock);
        clock.anchor = None;
    }

    fn ready_at(&self, target: ReadyState) -> Instant {
        let delay = if target <= ReadyState::Metadata {
            self.media.metadata_delay
        } else if self.buffered {
            // Everything is already in memory
            self.media.metadata_delay
        } else {
            self.media.buffer_delay.max(self.media.metadata_delay)
        };
        self.opened_at + delay
    }
}

struct SimResource {
    role: StreamRole,
    stream: Arc<SimStream>,
    shared: Arc<SimShared>,
}

#[async_trait]
impl MediaResource for SimResource {
    fn role(&self) -> StreamRole {
        self.role
    }

    fn duration(&self) -> Option<f64> {
        (self.ready_state() >= ReadyState::Metadata).then_some(self.stream.media.duration)
    }

    fn ready_state(&self) -> ReadyState {
        let now = Instant::now();
        if self.stream.media.fail_ready.is_some() || self.is_released() {
            ReadyState::Nothing
        } else if now >= self.stream.ready_at(ReadyState::EnoughData) {
            ReadyState::EnoughData
        } else if now >= self.stream.ready_at(ReadyState::Metadata) {
            ReadyState::Metadata
        } else {
            ReadyState::Nothing
        }
    }

    async fn wait_ready(&self, target: ReadyState) -> Result<(), MediaError> {
        if let Some(reason) = &self.stream.media.fail_ready {
            tokio::time::sleep_until(self.stream.ready_at(ReadyState::Metadata)).await;
            return Err(MediaError::Load(reason.clone()));
        }
        tokio::time::sleep_until(self.stream.ready_at(target)).await;
        if self.is_released() {
            return Err(MediaError::Released);
        }
        Ok(())
    }

    async fn play(&self) -> Result<(), MediaError> {
        if self.is_released() {
            return Err(MediaError::Released);
        }
        let rejected = self
            .stream
            .play_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(MediaError::PlayRejected(format!("{} not allowed to start", self.role)));
        }

        let mut clock = lock(&self.stream.clock);
        if self.stream.at_end(&clock) {
            clock.base = 0.0;
            clock.anchor = None;
        }
        if clock.anchor.is_none() {
            clock.anchor = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&self) {
        self.stream.pause();
    }

    fn is_paused(&self) -> bool {
        self.stream.is_paused()
    }

    fn position(&self) -> f64 {
        self.stream.position()
    }

    fn set_position(&self, seconds: f64) {
        if !self.is_released() {
            self.stream.set_position(seconds);
        }
    }

    fn set_rate(&self, rate: f64) {
        let mut clock = lock(&self.stream.clock);
        clock.base = self.stream.position_of(&clock);
        if clock.anchor.is_some() {
            clock.anchor = Some(Instant::now());
        }
        clock.rate = rate;
    }

    fn set_preserves_pitch(&self, preserve: bool) -> bool {
        if !self.stream.media.preserves_pitch {
            return false;
        }
        lock(&self.stream.clock).preserves_pitch = preserve;
        true
    }

    fn ended(&self) -> Option<bool> {
        if !self.stream.media.end_signal {
            return None;
        }
        let clock = lock(&self.stream.clock);
        Some(self.stream.at_end(&clock))
    }

    fn release(&self) {
        if !self.stream.released.swap(true, Ordering::SeqCst) {
            self.stream.pause();
            self.shared.live_resources.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_released(&self) -> bool {
        self.stream.released.load(Ordering::SeqCst)
    }
}

impl Drop for SimResource {
    fn drop(&mut self) {
        self.release();
    }
}

struct SimGraph {
    shared: Arc<SimShared>,
}

#[async_trait]
impl MixGraph for SimGraph {
    fn is_suspended(&self) -> bool {
        self.shared.graph_suspended.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.shared.graph_suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self, resource: &dyn MediaResource) -> Result<GraphConnection, MediaError> {
        if resource.is_released() {
            return Err(MediaError::Graph(format!("{} resource already released", resource.role())));
        }
        self.shared.live_connections.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        Ok(GraphConnection::new(resource.role(), move || {
            shared.live_connections.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

/// Test-side view of an opened stream
///
/// Changes made through a probe bypass the engine, simulating the resource
/// drifting or stalling on its own.
#[derive(Clone)]
pub struct SimProbe {
    stream: Arc<SimStream>,
}

impl SimProbe {
    pub fn position(&self) -> f64 {
        self.stream.position()
    }

    /// Move the playhead without the engine knowing
    pub fn force_position(&self, seconds: f64) {
        self.stream.set_position(seconds);
    }

    /// Silently stop playback, as a starved or interrupted element would
    pub fn stall(&self) {
        self.stream.pause();
    }

    pub fn is_paused(&self) -> bool {
        self.stream.is_paused()
    }

    pub fn rate(&self) -> f64 {
        lock(&self.stream.clock).rate
    }

    pub fn preserves_pitch(&self) -> bool {
        lock(&self.stream.clock).preserves_pitch
    }

    pub fn is_released(&self) -> bool {
        self.stream.released.load(Ordering::SeqCst)
    }

    pub fn is_buffered(&self) -> bool {
        self.stream.buffered
    }

    /// Reject the next `count` play() calls
    pub fn fail_next_plays(&self, count: u32) {
        self.stream.play_failures_left.store(count, Ordering::SeqCst);
    }
}
