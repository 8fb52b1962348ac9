//! Observability
//!
//! Structured session events and channel metrics.

pub mod audit;
pub mod metrics;
