//! Universal signal bus for intelligence fusion.
//!
//! Every data source emits typed, weighted, time-decaying signals into a
//! SQLite event log. Signals are fused using weighted log-odds combination.
//! The signal_weights table stores learned reliability as Beta posteriors
//! fed by user corrections.

pub mod bus;
pub mod cadence;
pub mod callouts;
pub mod correlation;
pub mod decay;
pub mod event_trigger;
pub mod feedback;
pub mod fusion;
pub mod invalidation;
pub mod patterns;
pub mod payload;
pub mod propagation;
pub mod relevance;
pub mod rules;
pub mod sampling;
