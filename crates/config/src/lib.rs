//! Configuration for the publish agent
//!
//! Handles loading configuration from TOML files and environment variable overrides,
//! and persisting the processing-agent settings file.

pub mod agent;
pub mod config;

pub use agent::*;
pub use config::*;
