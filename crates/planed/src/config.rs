//! Daemon configuration

use anyhow::Result;
use plane_lib::engine::EngineConfig;
use plane_lib::jobs::JobControllerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Which orchestrator adapter backs the site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Kube,
    /// In-process simulator, for local runs
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Kube => "kube",
            Backend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Site served by this daemon's orchestrator
    #[serde(default = "default_site_id")]
    pub site_id: String,

    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// JSON file with catalog entities loaded at startup
    #[serde(default)]
    pub catalog_seed: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub jobs: JobControllerConfig,
}

fn default_api_port() -> u16 {
    8080
}

fn default_site_id() -> String {
    std::env::var("SITE_ID").unwrap_or_else(|_| "default".to_string())
}

fn default_backend() -> Backend {
    Backend::Kube
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            site_id: default_site_id(),
            backend: default_backend(),
            catalog_seed: None,
            engine: EngineConfig::default(),
            jobs: JobControllerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `PLANED_CONFIG` and `PLANED_*` variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `PLANED_ENGINE__POLL_INTERVAL_MS=500`.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("PLANED_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("PLANED")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid configuration, using defaults");
            DaemonConfig::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.backend, Backend::Kube);
        assert_eq!(config.jobs.base_backoff_ms, 10_000);
        assert_eq!(config.jobs.max_backoff_ms, 360_000);
        assert!(config.catalog_seed.is_none());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{"backend": "memory", "engine": {"poll_interval_ms": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.engine.poll_interval_ms, 50);
        assert_eq!(config.engine.retry_times, EngineConfig::default().retry_times);
        assert_eq!(config.api_port, 8080);
    }
}
