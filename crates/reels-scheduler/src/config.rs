//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

/// Caption given to uploads that arrive without one.
pub const DEFAULT_CAPTION: &str = "Check out this amazing reel! 🔥";

/// Account used when intake does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Generation worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of concurrent generation workers.
    pub workers: usize,
    /// Pending generation requests before `enqueue` applies backpressure.
    pub queue_size: usize,
    /// Hard limit on a single backend call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_size: 64,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::with_retries(3),
        }
    }
}

/// Publish dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Maximum publish calls in flight across all accounts.
    pub workers: usize,
    /// Hard limit on a single publish call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::with_retries(5),
        }
    }
}

/// Publish scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the store is polled for due items.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for the whole orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub generation: GenerationConfig,
    pub publish: PublishConfig,
    pub scheduler: SchedulerConfig,
    pub default_caption: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            publish: PublishConfig::default(),
            scheduler: SchedulerConfig::default(),
            default_caption: DEFAULT_CAPTION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "generation": { "workers": 8 }, "default_caption": "hi" }"#;
        let config: OrchestratorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.generation.workers, 8);
        assert_eq!(config.generation.retry.max_retries, 3);
        assert_eq!(config.publish, PublishConfig::default());
        assert_eq!(config.default_caption, "hi");
    }
}
