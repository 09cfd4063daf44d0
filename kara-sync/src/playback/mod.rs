//! Sync engine and its satellite periodic tasks

pub mod attach;
pub mod engine;
pub mod looping;
pub mod nudger;
pub mod publisher;
pub mod retry;
pub mod state;

pub use attach::{AttachMode, AttachmentPipeline, Track, TrackSource};
pub use engine::{LoadSummary, SyncEngine};
pub use looping::{clamp_loop_bounds, LoopJump, LoopRegion};
pub use nudger::{SyncAction, SyncMeasurement};
pub use publisher::PositionSubscription;
pub use retry::RetryPolicy;
pub use state::{PlaybackState, SeekBarrier, TransportState};
