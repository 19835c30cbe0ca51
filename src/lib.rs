//! Envoy Meter Bridge Library
//!
//! This library turns an Enphase Envoy gateway into a stable source of flat,
//! named watt readings: it handles the Enlighten token lifecycle, polls the
//! device's meter endpoints, optionally consumes the live data stream, and
//! normalizes every payload shape into one canonical reading map.

pub mod config;
pub mod envoy_api;
pub mod envoy_reader;
pub mod error;
pub mod readings;
pub mod stream_reader;
pub mod token_manager;

// Re-export commonly used types for easier access
pub use config::EnvoyConfig;
pub use envoy_api::EnvoyApi;
pub use envoy_reader::EnvoyReader;
pub use error::{Error, Result};
pub use readings::{MeterDirectory, Reading};
pub use stream_reader::EnvoyStreamReader;
pub use token_manager::{Credential, TokenManager};
