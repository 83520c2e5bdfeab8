use serde::Deserialize;

/// Top-level broker configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub executor: ExecutorConfig,
    pub delivery: DeliveryConfig,
}

/// Background worker pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub task_queue_capacity: usize,
}

/// Delivery and commit tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-destination notification FIFO depth.
    pub notify_queue_capacity: usize,
    /// How long a producer thread may block enqueueing a notification
    /// before it is dropped (the watchdog self-heals a lost wake-up).
    pub notify_enqueue_timeout_ms: u64,
    /// Upper bound on the shared-barrier wait during commit.
    pub commit_wait_timeout_ms: u64,
    /// Period of the stuck-queue re-notify watchdog; 0 disables it.
    pub watchdog_interval_ms: u64,
}

impl BrokerConfig {
    /// Parse a TOML configuration document. Missing sections and keys
    /// fall back to their defaults.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_queue_capacity: 1024,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            notify_queue_capacity: 64,
            notify_enqueue_timeout_ms: 1_000,
            commit_wait_timeout_ms: 30_000,
            watchdog_interval_ms: 5_000,
        }
    }
}
