//! Error types for kara-sync
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Failures reported by a media backend or one of its resources
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Location could not be resolved to any media
    #[error("Media not found: {0}")]
    NotFound(String),

    /// Fetch-and-buffer of a placeholder location failed
    #[error("Fetch failed for {location}: {reason}")]
    FetchFailed { location: String, reason: String },

    /// Resource reported an error while loading
    #[error("Media load error: {0}")]
    Load(String),

    /// Resource did not reach the requested readiness in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Resource refused to start playing
    #[error("Play rejected: {0}")]
    PlayRejected(String),

    /// Operation on a resource whose handle was already released
    #[error("Resource already released")]
    Released,

    /// Mixing graph operation failed
    #[error("Mixing graph error: {0}")]
    Graph(String),
}

/// Track load errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Instrumental stream failed; no track is loaded
    #[error("Primary stream failed: {0}")]
    PrimaryFailed(MediaError),

    /// Vocal stream failed; the track plays primary-only
    #[error("Follower stream failed: {0}")]
    FollowerFailed(MediaError),

    /// A newer load_track call replaced this one before it completed
    #[error("Load superseded by a newer track")]
    Superseded,
}

/// Playback control errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// No track is loaded
    #[error("No track loaded")]
    NoTrack,

    /// Primary stream refused to start
    #[error("Primary start failed: {0}")]
    PrimaryStartFailed(MediaError),

    /// Follower did not start after the retry policy was exhausted
    #[error("Follower start failed after {attempts} attempts: {source}")]
    FollowerStartFailed { attempts: u32, source: MediaError },
}

/// Rejected loop bounds
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid loop region: start={start}, end={end}")]
pub struct InvalidLoopRegion {
    pub start: f64,
    pub end: f64,
}

/// Main error type for kara-sync
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] kara_common::Error),

    /// Backend failure outside of a load or play call
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience Result type using kara-sync Error
pub type Result<T> = std::result::Result<T, Error>;
