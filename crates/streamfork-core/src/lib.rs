//! `streamfork` Core Library
//!
//! Shared functionality for `streamfork` components:
//! - Relay configuration loading and environment overrides
//! - Common error types
//! - Tracing subscriber initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, Endpoint};
pub use error::{Error, Result};
