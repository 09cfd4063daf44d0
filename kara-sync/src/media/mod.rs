//! Playback resource abstraction
//!
//! The engine never decodes audio itself. A host supplies a [`MediaBackend`]
//! that opens playable resources (one per stream) and a mixing graph they are
//! routed through. [`sim::SimBackend`] is the in-tree implementation used by
//! tests and the headless binary.

pub mod sim;

use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which of the two synchronized streams a resource plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    /// Instrumental stream; its position is the authoritative clock
    Primary,
    /// Vocal stream kept aligned to the primary
    Follower,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Primary => write!(f, "primary"),
            StreamRole::Follower => write!(f, "follower"),
        }
    }
}

/// How much of a resource is available, in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Nothing,
    Metadata,
    CurrentData,
    FutureData,
    EnoughData,
}

/// Stream location as supplied by the track catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(String);

impl Location {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI scheme, if the location has one
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once(':')?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some(scheme)
    }

    /// True when this location cannot be handed to a resource as-is
    ///
    /// That is the case when it is empty, when it resolves to the host itself,
    /// or when it uses a volatile scheme whose handle may already be dangling.
    pub fn is_placeholder(&self, self_location: Option<&str>, volatile_schemes: &[String]) -> bool {
        let trimmed = self.0.trim();
        if trimmed.is_empty() || trimmed == "about:blank" {
            return true;
        }
        if self_location.is_some_and(|own| own == trimmed) {
            return true;
        }
        self.scheme()
            .is_some_and(|scheme| volatile_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Location {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Location {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// What a resource is opened from
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// Directly playable location
    Location(Location),
    /// Bytes fetched into memory from a placeholder location
    Buffered { origin: Location, data: Arc<[u8]> },
}

impl MediaSource {
    pub fn origin(&self) -> &Location {
        match self {
            MediaSource::Location(location) => location,
            MediaSource::Buffered { origin, .. } => origin,
        }
    }
}

/// One playable stream
///
/// Position and rate setters are fire-and-forget, matching how media elements
/// apply them asynchronously. `release` frees the underlying handle; it must be
/// idempotent and is also invoked on drop.
#[async_trait]
pub trait MediaResource: Send + Sync {
    fn role(&self) -> StreamRole;

    /// Duration from metadata, in seconds
    fn duration(&self) -> Option<f64>;

    fn ready_state(&self) -> ReadyState;

    /// Wait until the resource reaches `target` readiness or fails loading
    async fn wait_ready(&self, target: ReadyState) -> Result<(), MediaError>;

    async fn play(&self) -> Result<(), MediaError>;

    fn pause(&self);

    /// True when paused, ended, or never started
    fn is_paused(&self) -> bool;

    /// Current position in seconds
    fn position(&self) -> f64;

    fn set_position(&self, seconds: f64);

    fn set_rate(&self, rate: f64);

    /// Request pitch preservation; returns false when unsupported
    fn set_preserves_pitch(&self, preserve: bool) -> bool;

    /// Explicit end-of-stream signal, `None` when the resource has none
    fn ended(&self) -> Option<bool>;

    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Shared handle to an opened resource
pub type SharedResource = Arc<dyn MediaResource>;

/// Routing/mixing graph that resources are connected through
#[async_trait]
pub trait MixGraph: Send + Sync {
    fn is_suspended(&self) -> bool;

    async fn resume(&self) -> Result<(), MediaError>;

    /// Route a resource into the graph output
    fn connect(&self, resource: &dyn MediaResource) -> Result<GraphConnection, MediaError>;
}

/// Scoped graph connection; dropping it disconnects the resource
pub struct GraphConnection {
    role: StreamRole,
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl GraphConnection {
    pub fn new(role: StreamRole, disconnect: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            role,
            disconnect: Some(Box::new(disconnect)),
        }
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// Disconnect now instead of waiting for drop
    pub fn disconnect(mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl Drop for GraphConnection {
    fn drop(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl fmt::Debug for GraphConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConnection")
            .field("role", &self.role)
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

/// Host integration point: opens resources and builds the mixing graph
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Fetch the full contents of a location into memory
    async fn fetch(&self, location: &Location) -> Result<Vec<u8>, MediaError>;

    /// Open a resource; readiness is awaited separately
    async fn open(&self, role: StreamRole, source: MediaSource) -> Result<SharedResource, MediaError>;

    fn create_graph(&self) -> Result<Box<dyn MixGraph>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_placeholder_detection() {
        let schemes = vec!["blob".to_string()];
        let own = Some("https://kara.local/player");

        assert!(Location::new("").is_placeholder(own, &schemes));
        assert!(Location::new("  ").is_placeholder(own, &schemes));
        assert!(Location::new("about:blank").is_placeholder(own, &schemes));
        assert!(Location::new("https://kara.local/player").is_placeholder(own, &schemes));
        assert!(Location::new("BLOB:abc-123").is_placeholder(own, &schemes));

        assert!(!Location::new("https://cdn.kara.local/a.ogg").is_placeholder(own, &schemes));
        assert!(!Location::new("/srv/tracks/a.ogg").is_placeholder(None, &schemes));
    }

    #[test]
    fn test_scheme_parsing() {
        assert_eq!(Location::new("blob:xyz").scheme(), Some("blob"));
        assert_eq!(Location::new("file:///a.ogg").scheme(), Some("file"));
        assert_eq!(Location::new("/no/scheme").scheme(), None);
        assert_eq!(Location::new("c d:x").scheme(), None);
    }

    #[test]
    fn test_graph_connection_disconnects_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&flag);
        let connection = GraphConnection::new(StreamRole::Primary, move || {
            assert!(!seen.swap(true, Ordering::SeqCst), "disconnect ran twice");
        });

        assert_eq!(connection.role(), StreamRole::Primary);
        connection.disconnect();
        assert!(flag.load(Ordering::SeqCst));
    }
}
