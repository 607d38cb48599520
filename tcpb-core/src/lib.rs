//! tcp-balance Core Library
//!
//! This library provides core functionality for the tcp-balance system including:
//! - Configuration management
//! - Bind address and upstream specification parsing
//! - Shared error types

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::model::{
    BindAddress, Config, GlobalSettings, LoadBalanceStrategy, UpstreamSpec, DEFAULT_WEIGHT,
};
pub use error::ConfigError;
