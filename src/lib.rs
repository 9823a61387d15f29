//! Network usage accounting: per-interface, per-uid and per-tag traffic
//! history built from cumulative counters.

pub mod agent;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod migrate;
pub mod recorder;
pub mod stats;
