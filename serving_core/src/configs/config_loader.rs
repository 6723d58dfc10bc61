//! # Layered Configuration Loading
//!
//! Builds an `EngineConfig` in three layers, each overriding the previous one:
//!
//! 1. Built-in defaults.
//! 2. An optional JSON5 file (`serving.json5` unless a path is given, or the
//!    path in `SERVING_CONFIG_PATH`).
//! 3. Environment variables, after a `.env` file has been loaded.
//!
//! The merged result is validated before it is returned.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::configs::config_engine::EngineConfig;
use crate::errors::{Result, ServingError};

const DEFAULT_CONFIG_FILE: &str = "serving.json5";

/// Load, merge and validate the engine configuration.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();

    let config_path: PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => env::var("SERVING_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
    };

    let mut config = if config_path.is_file() {
        let text = fs::read_to_string(&config_path)?;
        let parsed = parse_config(&text)?;
        tracing::info!(path = %config_path.display(), "loaded engine configuration file");
        parsed
    } else {
        if path.is_some() {
            return Err(ServingError::config(format!(
                "configuration file {} does not exist",
                config_path.display()
            )));
        }
        tracing::debug!(path = %config_path.display(), "no configuration file, using defaults");
        EngineConfig::default()
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Parse a (possibly partial) JSON5 document into a configuration.
pub fn parse_config(text: &str) -> Result<EngineConfig> {
    json5::from_str::<EngineConfig>(text).map_err(|e| ServingError::config(format!("invalid configuration: {e}")))
}

fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
    if let Some(v) = env_parse::<f64>("SERVING_MEMORY_LIMIT_MB")? {
        config.resources.memory_limit_mb = v;
    }
    if let Some(v) = env_parse::<usize>("SERVING_MAX_THREADS")? {
        config.resources.max_threads = v;
    }
    if let Ok(level) = env::var("SERVING_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(dir) = env::var("SERVING_ROLLBACK_DIR") {
        config.rollback.storage_dir = PathBuf::from(dir);
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ServingError::config(format!("environment variable {key} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let cfg = parse_config(
            r#"{
                // only the batching bounds are overridden
                batching: { min_batch_size: 2, max_batch_size: 16 },
            }"#,
        )
        .expect("valid json5");
        assert_eq!(cfg.batching.min_batch_size, 2);
        assert_eq!(cfg.batching.max_batch_size, 16);
        assert_eq!(cfg.batching.default_batch_size, 8);
        assert_eq!(cfg.degradation.stability_period_secs, 120);
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        assert!(matches!(parse_config("{ batching: "), Err(ServingError::Config(_))));
    }

    #[test]
    fn explicit_missing_file_is_rejected() {
        let missing = Path::new("/definitely/not/here/serving.json5");
        assert!(load_config(Some(missing)).is_err());
    }
}
