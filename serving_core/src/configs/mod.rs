//! # Configuration Modules
//!
//! This module aggregates the per-component configuration structs and the
//! layered loader that assembles them.

/// Validated configuration structs for every subsystem.
pub mod config_engine;

/// Defaults, JSON5 file and environment layering.
pub mod config_loader;

pub use config_engine::*;
pub use config_loader::{load_config, parse_config};
