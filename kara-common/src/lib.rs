//! # Karaoke Common Library
//!
//! Shared code for the karaoke transport core and its collaborators:
//! - Event types (KaraokeEvent enum) and the per-engine EventBus
//! - Configuration file resolution and loading
//! - Common error types

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
