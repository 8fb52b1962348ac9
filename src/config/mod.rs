//! Configuration
//!
//! Shared type definitions, error taxonomy and configuration loading.

pub mod settings;
pub mod types;
