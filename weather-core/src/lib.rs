//! Core library for the weather service.
//!
//! This crate defines:
//! - Layered configuration resolution (base file, mode file, `APP_*` overrides)
//! - The structured logging bootstrap
//!
//! It is used by `weather-server`, but can also be reused by other binaries or services.

pub mod config;
pub mod logger;

pub use config::{
    Config, ConfigError, ConfigLoader, HttpConfig, LoggerConfig, Resolution, SkippedLayer,
};
pub use logger::{LogFormat, Logger};
