//! Trailbot Trading Library
//!
//! Core components of the trailbot breakout/trailing-protection trading
//! system: the per-symbol state machine, the event-polling fill attribution
//! engine, position sizing, market-hours gating, and the restart-safe
//! persistence layer.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
