//! # Karaoke Sync Library (kara-sync)
//!
//! Transport and synchronization core of the karaoke player.
//!
//! **Purpose:** Drive an instrumental (primary) stream and an optional vocal
//! (follower) stream through play, pause, stop, seek, rate changes and region
//! looping, keeping the follower aligned to the primary's clock.
//!
//! **Architecture:** One `SyncEngine` per player owns both playback resources
//! and the mixing graph. Loop checks, drift correction and position publishing
//! run as tokio interval tasks guarded by generation counters.

pub mod config;
pub mod error;
pub mod media;
pub mod playback;

pub use config::TomlConfig;
pub use error::{Error, LoadError, MediaError, PlaybackError, Result};
pub use media::Location;
pub use playback::SyncEngine;
