//! Signal intelligence engine.
//!
//! Collects evidence about entities (accounts, projects, people, meetings)
//! as typed, weighted, time-decaying signals in an append-only SQLite log,
//! fuses them to resolve meetings to entities, learns source reliability from
//! user corrections, derives higher-level signals through propagation rules,
//! and surfaces ranked callouts and invalidations downstream.

pub mod config;
pub mod db;
pub mod embeddings;
pub mod engine;
pub mod entity;
pub mod error;
mod migrations;
pub mod proactive;
pub mod resolver;
pub mod scheduler;
pub mod signals;
pub mod util;

pub use config::EngineConfig;
pub use engine::SignalEngine;
pub use error::EngineError;
