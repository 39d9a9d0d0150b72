//! Proactive surfacing engine.
//!
//! Periodically mines the store for temporal patterns and emits the
//! resulting insights as signals, where propagation rules and callouts pick
//! them up.

pub mod detectors;
pub mod engine;
