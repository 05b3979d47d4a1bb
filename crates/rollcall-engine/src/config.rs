use rollcall_core::{RenderOptions, DEFAULT_MATCH_THRESHOLD};
use rollcall_store::{StoreBackend, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration: defaults, optionally a TOML file, then `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Euclidean distance below which a face matches a student.
    pub match_threshold: f32,
    /// Images processed at the same time, across all requests.
    pub max_concurrent_images: usize,
    /// Timeout in seconds for each blob store call.
    pub store_timeout_secs: u64,
    /// Attempts made to delete an upload whose outcome could not be recorded.
    pub delete_attempts: u32,
    /// JPEG quality of annotated images.
    pub jpeg_quality: u8,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            max_concurrent_images: 4,
            store_timeout_secs: 10,
            delete_attempts: 3,
            jpeg_quality: 90,
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Load `path` (if given) and apply environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        Ok(base.overlay(|key| std::env::var(key).ok()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let parsed: Self = toml::from_str(text)?;
        Ok(parsed.sanitized())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn overlay(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let store = StoreConfig {
            backend: env_parse(&lookup, "ROLLCALL_STORE_BACKEND").unwrap_or(self.store.backend),
            root: lookup("ROLLCALL_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(self.store.root),
            bucket: lookup("ROLLCALL_BUCKET").unwrap_or(self.store.bucket),
            region: lookup("ROLLCALL_REGION").unwrap_or(self.store.region),
            public_base_url: lookup("ROLLCALL_PUBLIC_BASE_URL").or(self.store.public_base_url),
        };

        Self {
            match_threshold: env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD")
                .unwrap_or(self.match_threshold),
            max_concurrent_images: env_parse(&lookup, "ROLLCALL_MAX_CONCURRENT_IMAGES")
                .unwrap_or(self.max_concurrent_images),
            store_timeout_secs: env_parse(&lookup, "ROLLCALL_STORE_TIMEOUT_SECS")
                .unwrap_or(self.store_timeout_secs),
            delete_attempts: env_parse(&lookup, "ROLLCALL_DELETE_ATTEMPTS")
                .unwrap_or(self.delete_attempts),
            jpeg_quality: env_parse(&lookup, "ROLLCALL_JPEG_QUALITY").unwrap_or(self.jpeg_quality),
            store,
        }
        .sanitized()
    }

    /// Replace out-of-range values with their defaults.
    pub(crate) fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            tracing::warn!(value = self.match_threshold, "invalid match threshold; using default");
            self.match_threshold = defaults.match_threshold;
        }
        if self.max_concurrent_images == 0 || self.max_concurrent_images > Semaphore::MAX_PERMITS {
            tracing::warn!(
                value = self.max_concurrent_images,
                "invalid concurrency limit; using default"
            );
            self.max_concurrent_images = defaults.max_concurrent_images;
        }
        if self.store_timeout_secs == 0 {
            self.store_timeout_secs = defaults.store_timeout_secs;
        }
        if self.delete_attempts == 0 {
            self.delete_attempts = defaults.delete_attempts;
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            self.jpeg_quality = defaults.jpeg_quality;
        }
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            jpeg_quality: self.jpeg_quality,
            ..RenderOptions::default()
        }
    }

    /// True when annotated images are only kept in memory.
    pub fn is_dry_run(&self) -> bool {
        self.store.backend == StoreBackend::Memory
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
