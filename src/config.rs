//! Tunable defaults for every subsystem, gathered in one place so a
//! collaborator's config-file loader has a single struct to populate.
//!
//! `Config::default()` reproduces every default named in `spec.md` §4 and §5.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Capacity of the raw-event input channel.
    pub input_capacity: usize,
    /// Debounce window: flush a path once this long passes with no new event.
    pub debounce_window: Duration,
    /// Flush a batch once `pending` reaches this many paths.
    pub max_batch_size: usize,
    /// Hard ceiling on how long a batch can be held before a forced flush.
    pub hard_ceiling: Duration,
    /// Capacity of the output channel handed to subscribers.
    pub output_capacity: usize,
    /// Retry budget for "watch removed" auto-rearm before surfacing an error.
    pub rearm_retry_budget: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            input_capacity: 1024,
            debounce_window: Duration::from_millis(100),
            max_batch_size: 50,
            hard_ceiling: Duration::from_millis(500),
            output_capacity: 256,
            rearm_retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consecutive dropped messages before a subscriber is force-disconnected.
    pub max_subscriber_drops: u32,
    /// Bounded channel capacity handed to each subscriber.
    pub subscriber_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriber_drops: 32,
            subscriber_channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Upper bound on concurrent file parses during a directory scan.
    pub max_parallelism: usize,
    /// Glob patterns ignored in addition to the built-in VCS/dependency rules.
    pub extra_ignore_globs: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::cmp::min(num_cpus::get(), 8),
            extra_ignore_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of worker tasks, clamped to `[2, 16]`.
    pub worker_count: usize,
    /// Toolchain subprocess timeout.
    pub toolchain_timeout: Duration,
    /// Maximum entries retained in the build cache.
    pub cache_capacity: usize,
    /// Captured stdout/stderr is truncated to this many bytes.
    pub output_cap_bytes: usize,
    /// Pooled buffer working-set band; buffers outside this range are
    /// discarded on return instead of recycled.
    pub pool_min_bytes: usize,
    pub pool_max_bytes: usize,
    /// Initial capacity for freshly allocated pooled buffers.
    pub pool_initial_bytes: usize,
    /// Retry budget for transient `IOError`s during a build.
    pub io_retry_budget: u32,
    pub io_retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(2);
        Self {
            worker_count: cpus.clamp(2, 16),
            toolchain_timeout: Duration::from_secs(30),
            cache_capacity: 1024,
            output_cap_bytes: 32 * 1024,
            pool_min_bytes: 1024,
            pool_max_bytes: 64 * 1024,
            pool_initial_bytes: 4 * 1024,
            io_retry_budget: 2,
            io_retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub max_global_connections: usize,
    pub max_connections_per_remote: usize,
    pub max_message_bytes: usize,
    pub idle_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_messages: u32,
    pub send_queue_capacity: usize,
    pub drain_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_global_connections: 100,
            max_connections_per_remote: 20,
            max_message_bytes: 512,
            idle_timeout: Duration::from_secs(5 * 60),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_messages: 60,
            send_queue_capacity: 8,
            drain_timeout: Duration::from_secs(1),
            allowed_origins: Vec::new(),
        }
    }
}

/// Top-level configuration for every `templar` subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub registry: RegistryConfig,
    pub scanner: ScannerConfig,
    pub pipeline: PipelineConfig,
    pub broker: BrokerConfig,
}
