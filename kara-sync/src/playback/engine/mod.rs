//! Sync engine module
//!
//! **Module Structure:**
//! - `core.rs`: Engine handle, shared state, track load and teardown
//! - `transport.rs`: play, pause, stop, seek, rate and accessors
//!
//! Loop control, drift correction and position publishing extend the same
//! `SyncEngine` from their own modules under `playback/`.

mod core;
mod transport;

pub use self::core::{LoadSummary, SyncEngine};
pub(crate) use self::core::{lock, StreamSet};
