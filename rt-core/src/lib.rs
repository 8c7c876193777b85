//! Shared foundation for the rtsync crates: the error type, TOML
//! configuration, tracing setup and per-user paths.

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod paths;

pub use config::AppConfig;
pub use error::{RtError, RtResult};
pub use logging::{init_from_config, init_logging, LogGuard};
