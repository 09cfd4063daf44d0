//! Stream attachment pipeline
//!
//! **Responsibilities:**
//! - Resolve primary and follower locations into ready resources, concurrently
//! - Materialize placeholder locations into memory-backed sources
//! - Route attached resources into the mixing graph
//! - Degrade to primary-only when the follower cannot be attached
//! - Provide the follower start sequence shared by play() and re-attachment

use crate::config::AttachConfig;
use crate::error::{LoadError, MediaError, PlaybackError};
use crate::media::{
    GraphConnection, Location, MediaBackend, MediaSource, MixGraph, ReadyState, SharedResource,
    StreamRole,
};
use crate::playback::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the catalog hands over for one track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSource {
    pub primary: Location,
    pub follower: Option<Location>,
    /// Used when the primary's metadata carries no usable duration
    pub duration_hint: Option<f64>,
}

impl TrackSource {
    pub fn new(primary: impl Into<Location>) -> Self {
        Self {
            primary: primary.into(),
            follower: None,
            duration_hint: None,
        }
    }

    pub fn with_follower(mut self, follower: impl Into<Location>) -> Self {
        self.follower = Some(follower.into());
        self
    }

    pub fn with_duration_hint(mut self, duration: f64) -> Self {
        self.duration_hint = Some(duration);
        self
    }
}

/// Attached track; immutable once handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub primary: Location,
    pub follower: Option<Location>,
    /// Seconds
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Dual,
    PrimaryOnly,
}

/// Ready resources plus their graph connections
pub struct Attachment {
    pub track: Track,
    pub primary: SharedResource,
    pub follower: Option<SharedResource>,
    pub connections: Vec<GraphConnection>,
    pub mode: AttachMode,
    /// Set when the track asked for a follower that could not be attached
    pub follower_error: Option<LoadError>,
}

impl Attachment {
    pub fn has_follower(&self) -> bool {
        self.follower.is_some()
    }

    /// Reason the requested follower was dropped, for `FollowerUnavailable`
    pub fn follower_unavailable_reason(&self) -> Option<String> {
        match &self.follower_error {
            Some(LoadError::FollowerFailed(e)) => Some(e.to_string()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }

    /// Disconnect and release everything this attachment holds
    pub fn release(self) {
        drop(self.connections);
        self.primary.release();
        if let Some(follower) = &self.follower {
            follower.release();
        }
    }
}

pub struct AttachmentPipeline {
    backend: Arc<dyn MediaBackend>,
    config: AttachConfig,
}

impl AttachmentPipeline {
    pub fn new(backend: Arc<dyn MediaBackend>, config: AttachConfig) -> Self {
        Self { backend, config }
    }

    /// Attach both streams of a track and route them through `graph`
    ///
    /// Fails only when the primary fails. A follower failure yields a
    /// primary-only attachment carrying the follower's error; announcing it is
    /// left to the caller, which knows whether the load still counts.
    pub async fn attach(&self, source: &TrackSource, graph: &dyn MixGraph) -> Result<Attachment, LoadError> {
        let primary_fut = self.acquire(
            StreamRole::Primary,
            &source.primary,
            ReadyState::Metadata,
            self.config.primary_ready_timeout(),
        );
        let follower_fut = async {
            match &source.follower {
                Some(location) => Some(
                    self.acquire(
                        StreamRole::Follower,
                        location,
                        ReadyState::EnoughData,
                        self.config.follower_ready_timeout(),
                    )
                    .await,
                ),
                None => None,
            }
        };

        let (primary, follower) = tokio::join!(primary_fut, follower_fut);

        let primary = match primary {
            Ok(primary) => primary,
            Err(e) => {
                if let Some(Ok(follower)) = &follower {
                    follower.release();
                }
                error!("Primary stream {} failed: {}", source.primary, e);
                return Err(LoadError::PrimaryFailed(e));
            }
        };

        let duration = match resolve_duration(primary.duration(), source.duration_hint) {
            Some(duration) => duration,
            None => {
                primary.release();
                if let Some(Ok(follower)) = &follower {
                    follower.release();
                }
                let e = MediaError::Load("primary has no usable duration".to_string());
                error!("Primary stream {} failed: {}", source.primary, e);
                return Err(LoadError::PrimaryFailed(e));
            }
        };

        let primary_connection = match graph.connect(primary.as_ref()) {
            Ok(connection) => connection,
            Err(e) => {
                primary.release();
                if let Some(Ok(follower)) = &follower {
                    follower.release();
                }
                error!("Could not route primary stream: {}", e);
                return Err(LoadError::PrimaryFailed(e));
            }
        };
        let mut connections = vec![primary_connection];

        let follower = match follower {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(follower)) => match graph.connect(follower.as_ref()) {
                Ok(connection) => {
                    connections.push(connection);
                    Ok(Some(follower))
                }
                Err(e) => {
                    follower.release();
                    Err(e)
                }
            },
        };

        let (follower, follower_error) = match follower {
            Ok(follower) => (follower, None),
            Err(e) => {
                warn!("Follower stream unavailable, continuing primary-only: {}", e);
                (None, Some(LoadError::FollowerFailed(e)))
            }
        };

        let mode = if follower.is_some() {
            AttachMode::Dual
        } else {
            AttachMode::PrimaryOnly
        };
        info!(
            "Attached {} ({:.3}s, mode={:?})",
            source.primary, duration, mode
        );

        Ok(Attachment {
            track: Track {
                primary: source.primary.clone(),
                follower: source.follower.clone(),
                duration,
            },
            primary,
            follower,
            connections,
            mode,
            follower_error,
        })
    }

    /// Open one stream and wait for `target` readiness
    async fn acquire(
        &self,
        role: StreamRole,
        location: &Location,
        target: ReadyState,
        timeout: Duration,
    ) -> Result<SharedResource, MediaError> {
        let source = self.resolve_source(location).await?;
        let resource = self.backend.open(role, source).await?;

        match tokio::time::timeout(timeout, resource.wait_ready(target)).await {
            Ok(Ok(())) => {
                debug!("{} stream ready ({:?})", role, resource.ready_state());
                Ok(resource)
            }
            Ok(Err(e)) => {
                resource.release();
                Err(e)
            }
            Err(_) => {
                resource.release();
                Err(MediaError::Timeout(format!("{} {:?}", role, target)))
            }
        }
    }

    /// Turn a location into something a resource can safely be opened from
    ///
    /// Placeholder locations are fetched and buffered in memory first, since a
    /// resource pointed at them would point at nothing.
    pub async fn resolve_source(&self, location: &Location) -> Result<MediaSource, MediaError> {
        if !location.is_placeholder(self.config.self_location.as_deref(), &self.config.materialize_schemes) {
            return Ok(MediaSource::Location(location.clone()));
        }

        debug!("Materializing placeholder location {:?}", location.as_str());
        let bytes = self.backend.fetch(location).await?;
        Ok(MediaSource::Buffered {
            origin: location.clone(),
            data: Arc::from(bytes),
        })
    }

    /// Align the follower to the primary and start it under `policy`
    pub async fn start_follower(
        follower: &SharedResource,
        primary: &SharedResource,
        rate: f64,
        policy: &RetryPolicy,
    ) -> Result<(), PlaybackError> {
        policy
            .run(|_attempt| {
                let follower = Arc::clone(follower);
                let primary = Arc::clone(primary);
                async move {
                    follower.set_rate(rate);
                    follower.set_position(primary.position());
                    follower.play().await
                }
            })
            .await
            .map_err(|(attempts, source)| PlaybackError::FollowerStartFailed { attempts, source })
    }
}

fn resolve_duration(metadata: Option<f64>, hint: Option<f64>) -> Option<f64> {
    metadata
        .filter(|d| d.is_finite() && *d > 0.0)
        .or_else(|| hint.filter(|d| d.is_finite() && *d > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::sim::{SimBackend, SimMedia};
    use crate::media::MediaBackend;

    fn pipeline(backend: &SimBackend) -> AttachmentPipeline {
        let config = AttachConfig {
            self_location: Some("https://kara.local/".to_string()),
            ..AttachConfig::default()
        };
        AttachmentPipeline::new(Arc::new(backend.clone()), config)
    }

    #[test]
    fn test_resolve_duration_prefers_metadata() {
        assert_eq!(resolve_duration(Some(180.0), Some(170.0)), Some(180.0));
        assert_eq!(resolve_duration(Some(f64::INFINITY), Some(170.0)), Some(170.0));
        assert_eq!(resolve_duration(None, None), None);
        assert_eq!(resolve_duration(Some(0.0), Some(-1.0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_is_materialized() {
        let backend = SimBackend::new();
        backend.register("blob:vocals-1", SimMedia::new(60.0));
        let pipeline = pipeline(&backend);

        let source = pipeline.resolve_source(&"blob:vocals-1".into()).await.unwrap();
        assert!(matches!(source, MediaSource::Buffered { .. }));
        assert_eq!(backend.fetch_count(), 1);

        let direct = pipeline.resolve_source(&"https://cdn/a.ogg".into()).await.unwrap();
        assert!(matches!(direct, MediaSource::Location(_)));
        assert_eq!(backend.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_releases_follower() {
        let backend = SimBackend::new();
        backend.register("inst.ogg", SimMedia::new(60.0).failing_ready("decode error"));
        backend.register("vox.ogg", SimMedia::new(60.0));
        let pipeline = pipeline(&backend);
        let graph = backend.create_graph().unwrap();

        let source = TrackSource::new("inst.ogg").with_follower("vox.ogg");
        let result = pipeline.attach(&source, graph.as_ref()).await;

        assert!(matches!(result, Err(LoadError::PrimaryFailed(_))));
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_timeout_degrades() {
        let backend = SimBackend::new();
        backend.register("inst.ogg", SimMedia::new(60.0));
        backend.register(
            "vox.ogg",
            SimMedia::new(60.0).with_delays(Duration::from_millis(10), Duration::from_secs(60)),
        );
        let pipeline = pipeline(&backend);
        let graph = backend.create_graph().unwrap();

        let source = TrackSource::new("inst.ogg").with_follower("vox.ogg");
        let attachment = pipeline.attach(&source, graph.as_ref()).await.unwrap();

        assert_eq!(attachment.mode, AttachMode::PrimaryOnly);
        assert!(matches!(
            attachment.follower_error,
            Some(LoadError::FollowerFailed(MediaError::Timeout(_)))
        ));
        assert!(attachment
            .follower_unavailable_reason()
            .is_some_and(|reason| reason.starts_with("Timed out")));
        // Only the primary remains open and routed
        assert_eq!(backend.live_resources(), 1);
        assert_eq!(backend.live_connections(), 1);

        attachment.release();
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(backend.live_connections(), 0);
    }
}
