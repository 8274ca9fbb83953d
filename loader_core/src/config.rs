use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PREVIEW_MAX_DIMENSION: u32 = 400;
pub const DEFAULT_MAX_CACHED_IMAGES: usize = 150;
pub const DEFAULT_MAX_CACHED_BYTES: usize = 360 * 1024 * 1024;
pub const DEFAULT_CRITICAL_CONCURRENCY: usize = 12;
pub const DEFAULT_BATCH_QUANTITY_LIMIT: usize = 1;
pub const DEFAULT_BATCH_TIME_LIMIT_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("invalid loader config: {0}")]
    Config(String),
    #[error("failed to parse loader config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// How stage work is executed. `Manual` spawns no render workers; the owner
/// drives the queues with `LoaderEngine::step` / `LoaderEngine::pump`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Threaded,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub quantity_limit: usize,
    pub time_limit_ms: u64,
}

impl BatchConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.quantity_limit == 0 {
            return Err(LoaderError::Config(
                "batch.quantity_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            quantity_limit: DEFAULT_BATCH_QUANTITY_LIMIT,
            time_limit_ms: DEFAULT_BATCH_TIME_LIMIT_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub mode: ExecutionMode,
    pub preview_max_dimension: u32,
    pub max_cached_images: usize,
    pub max_cached_bytes: usize,
    pub critical_concurrency: usize,
    pub batch: BatchConfig,
}

impl LoaderConfig {
    pub fn manual() -> Self {
        Self {
            mode: ExecutionMode::Manual,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, LoaderError> {
        let config: LoaderConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.preview_max_dimension == 0 {
            return Err(LoaderError::Config(
                "preview_max_dimension must be at least 1".to_string(),
            ));
        }
        if self.max_cached_images == 0 {
            return Err(LoaderError::Config(
                "max_cached_images must be at least 1".to_string(),
            ));
        }
        if self.max_cached_bytes == 0 {
            return Err(LoaderError::Config(
                "max_cached_bytes must be at least 1".to_string(),
            ));
        }
        if self.critical_concurrency == 0 {
            return Err(LoaderError::Config(
                "critical_concurrency must be at least 1".to_string(),
            ));
        }
        self.batch.validate()
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Threaded,
            preview_max_dimension: DEFAULT_PREVIEW_MAX_DIMENSION,
            max_cached_images: DEFAULT_MAX_CACHED_IMAGES,
            max_cached_bytes: DEFAULT_MAX_CACHED_BYTES,
            critical_concurrency: DEFAULT_CRITICAL_CONCURRENCY,
            batch: BatchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = LoaderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_cached_bytes, 377_487_360);
        assert_eq!(config.batch.time_limit(), Duration::from_millis(200));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = LoaderConfig::from_toml_str(
            r#"
mode = "manual"
max_cached_images = 6

[batch]
quantity_limit = 4
"#,
        )
        .unwrap();
        assert_eq!(config.mode, ExecutionMode::Manual);
        assert_eq!(config.max_cached_images, 6);
        assert_eq!(config.preview_max_dimension, DEFAULT_PREVIEW_MAX_DIMENSION);
        assert_eq!(config.batch.quantity_limit, 4);
        assert_eq!(config.batch.time_limit_ms, DEFAULT_BATCH_TIME_LIMIT_MS);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = LoaderConfig::from_toml_str("critical_concurrency = 0").unwrap_err();
        assert!(matches!(err, LoaderError::Config(_)));
        let err = LoaderConfig::from_toml_str("[batch]\nquantity_limit = 0").unwrap_err();
        assert!(err.to_string().contains("batch.quantity_limit"));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = LoaderConfig::from_toml_str("preview_size = 10").unwrap_err();
        assert!(matches!(err, LoaderError::Toml(_)));
        let err = LoaderConfig::from_toml_str("mode = \"inline\"").unwrap_err();
        assert!(matches!(err, LoaderError::Toml(_)));
    }
}
