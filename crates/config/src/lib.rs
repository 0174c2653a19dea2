//! Configuration module for the disc ripper
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and home-directory expansion of configured paths.

pub mod config;

pub use config::*;
