//! HTTP glue around the debridfs storage engine.

pub mod api;
pub mod metrics;
pub mod state;
