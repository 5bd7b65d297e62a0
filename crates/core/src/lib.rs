//! Core utilities for the Ember RHI.
//!
//! This crate provides foundational types and utilities used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Timer utilities
//! - Configuration management

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::RhiConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::Timer;
