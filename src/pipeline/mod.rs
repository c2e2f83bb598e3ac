//! Session-level building blocks of the render pipeline
//!
//! - [`state`]: element states and the single-step transitions between them
//! - [`pts`]: 90 kHz timestamp tracking and playback position
//! - [`geometry`]: video rectangle and letterboxing
//! - [`health`]: counters snapshot

pub mod geometry;
pub mod health;
pub mod pts;
pub mod state;

pub use geometry::{VideoRect, WindowGeometry};
pub use health::SinkStats;
pub use pts::{PtsTracker, Segment};
pub use state::{ElementState, Transition, TransitionOutcome};
