//! Utility helpers

pub mod telemetry;

pub use telemetry::init_tracing;
