//! Replay: one-shot token correlation plus the engine that re-issues a
//! captured request through the local proxy.

pub mod engine;
pub mod tracker;

pub use engine::{ReplayEngine, ReplayError};
pub use tracker::{ReplayOrigin, ReplayTracker};
