//! Agent configuration

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration, read from `PODSTAT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in structured logs (pod name when run in-cluster)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Watch supervisor tick interval in seconds
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    /// Lifetime of cached pod resource usage in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Wait after a watch starts before its cluster is reported as aggregated
    #[serde(default = "default_initial_sync_delay")]
    pub initial_sync_delay_secs: u64,

    /// Comma-separated kubeconfig contexts; empty means the default client
    #[serde(default)]
    pub contexts: String,

    /// Explicit kubeconfig path
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "podstat".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_watch_interval() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_initial_sync_delay() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            watch_interval_secs: default_watch_interval(),
            cache_ttl_secs: default_cache_ttl(),
            initial_sync_delay_secs: default_initial_sync_delay(),
            contexts: String::new(),
            kubeconfig: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PODSTAT"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Kubeconfig contexts to watch, in configuration order
    pub fn context_list(&self) -> Vec<String> {
        self.contexts
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_secs(self.initial_sync_delay_secs)
    }
}
