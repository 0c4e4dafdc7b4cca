//! Shared utilities, configuration, and error handling for Shootout
//!
//! This crate provides common functionality used across the Shootout service:
//! - Configuration management following 12-factor principles
//! - Error types and handling
//! - Wall-clock abstraction for deterministic tests

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
