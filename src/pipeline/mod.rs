//! Build pipeline: external toolchain invocation, content-addressed caching,
//! a bounded worker pool, and object pooling (`spec.md` §4.4).

mod cache;
mod queue;
mod worker;

pub use cache::{cache_key, BuildCache};
pub use queue::TaskQueue;
pub use worker::ToolchainPaths;

use crate::config::PipelineConfig;
use crate::pool::ShardedBytePool;
use crate::types::{BuildErrorKind, BuildResult, BuildTask, ComponentInfo, Priority};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

pub type BuildCallback = Arc<dyn Fn(BuildResult) + Send + Sync>;

/// Observability counters exposed by `GetMetrics`.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Default)]
struct AtomicMetrics {
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl AtomicMetrics {
    fn snapshot(&self) -> Metrics {
        Metrics {
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_succeeded: self.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    config: PipelineConfig,
    toolchain: ToolchainPaths,
    toolchain_version: String,
    build_flags: Vec<String>,
    queue: TaskQueue,
    cache: BuildCache,
    pool: ShardedBytePool,
    callbacks: RwLock<Vec<BuildCallback>>,
    metrics: AtomicMetrics,
}

/// Compiles components via an external generator/compiler toolchain, caches
/// outputs by content, and publishes `BuildResult`s to registered callbacks.
pub struct Pipeline {
    inner: Arc<Inner>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, toolchain: ToolchainPaths, toolchain_version: impl Into<String>) -> Self {
        let toolchain_version = toolchain_version.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = config.worker_count.clamp(2, 16);
        Self {
            inner: Arc::new(Inner {
                cache: BuildCache::new(config.cache_capacity, toolchain_version.clone()),
                pool: ShardedBytePool::new(
                    worker_count,
                    config.pool_min_bytes,
                    config.pool_max_bytes,
                    config.pool_initial_bytes,
                ),
                queue: TaskQueue::new(),
                toolchain,
                toolchain_version,
                build_flags: Vec::new(),
                callbacks: RwLock::new(Vec::new()),
                metrics: AtomicMetrics::default(),
                config,
            }),
            workers: std::sync::Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn add_callback(&self, callback: impl Fn(BuildResult) + Send + Sync + 'static) {
        self.inner.callbacks.write().expect("callbacks poisoned").push(Arc::new(callback));
    }

    /// Enqueue at normal priority.
    pub fn build(&self, component: ComponentInfo) {
        self.enqueue(component, Priority::Normal);
    }

    /// Enqueue at high priority (head-of-line among waiting tasks).
    pub fn build_with_priority(&self, component: ComponentInfo) {
        self.enqueue(component, Priority::High);
    }

    fn enqueue(&self, component: ComponentInfo, priority: Priority) {
        self.inner.queue.enqueue(BuildTask {
            component,
            priority,
            enqueued_at: std::time::SystemTime::now(),
        });
    }

    pub fn get_metrics(&self) -> Metrics {
        self.inner.metrics.snapshot()
    }

    pub fn get_cache(&self) -> &BuildCache {
        &self.inner.cache
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Start `W` worker tasks (default `numCPU`, clamped to `[2, 16]`).
    pub fn start(&self) {
        let worker_count = self.inner.config.worker_count.clamp(2, 16);
        let mut workers = self.workers.lock().expect("workers poisoned");
        for index in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.shutdown_rx.clone();
            workers.push(tokio::spawn(worker_loop(inner, index, shutdown_rx)));
        }
        info!(workers = worker_count, "build pipeline started");
    }

    /// Stop the pipeline. Workers are aborted at their next await point;
    /// a build already inside the toolchain timeout window is cut off
    /// rather than waited out.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().expect("workers poisoned");
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_index: usize, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let task = tokio::select! {
            _ = shutdown_rx.changed() => break,
            task = inner.queue.pop() => task,
        };

        inner.metrics.builds_started.fetch_add(1, Ordering::Relaxed);
        let result = run_task(&inner, worker_index, &task).await;
        inner.metrics.builds_succeeded.fetch_add(result.success as u64, Ordering::Relaxed);
        inner.metrics.builds_failed.fetch_add((!result.success) as u64, Ordering::Relaxed);

        let callbacks = inner.callbacks.read().expect("callbacks poisoned").clone();
        for callback in callbacks {
            callback(result.clone());
        }

        if inner.queue.complete(&task.component.name) {
            // A change arrived while this build was in flight — re-queue at
            // normal priority so the latest source is reflected.
            inner.queue.enqueue(BuildTask {
                component: task.component,
                priority: Priority::Normal,
                enqueued_at: std::time::SystemTime::now(),
            });
        }
    }
}

async fn run_task(inner: &Arc<Inner>, worker_index: usize, task: &BuildTask) -> BuildResult {
    let component = &task.component;
    let key = cache_key(
        &component.content_hash,
        &component.parameter_list_hash(),
        &inner.toolchain_version,
        &inner.build_flags,
    );

    if let Some(entry) = inner.cache.get(&key) {
        if is_valid_artifact_hash(&entry.artifact_hash) {
            inner.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return BuildResult {
                component_name: component.name.clone(),
                success: true,
                cached: true,
                duration: std::time::Duration::ZERO,
                stdout: String::new(),
                stderr: String::new(),
                error_kind: None,
                artifact_hash: Some(entry.artifact_hash),
            };
        }
        // A malformed entry reached the cache somehow (e.g. a future
        // persisted-cache backend handing back truncated data). Evict it
        // and fall through to a fresh build rather than serve garbage.
        warn!(key = %key, "discarding corrupt cache entry");
        inner.cache.evict(&key);
    }
    inner.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

    let start = std::time::Instant::now();
    let pool = inner.pool.shard(worker_index);
    let allowlist = inner.toolchain.allowlist();

    let mut attempts = 0u32;
    loop {
        let outcome = run_toolchain_pair(inner, component, pool, &allowlist).await;
        match outcome {
            Ok((stdout, stderr, true)) => {
                let artifact_hash = blake3::hash(&stdout).to_hex().to_string();
                inner.cache.insert(
                    key.clone(),
                    crate::types::CacheEntry {
                        artifact_hash: artifact_hash.clone(),
                        toolchain_version: inner.toolchain_version.clone(),
                        compiled_at: std::time::SystemTime::now(),
                    },
                );
                return BuildResult {
                    component_name: component.name.clone(),
                    success: true,
                    cached: false,
                    duration: start.elapsed(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    error_kind: None,
                    artifact_hash: Some(artifact_hash),
                };
            }
            Ok((stdout, stderr, false)) => {
                return BuildResult {
                    component_name: component.name.clone(),
                    success: false,
                    cached: false,
                    duration: start.elapsed(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    error_kind: Some(BuildErrorKind::CompileError),
                    artifact_hash: None,
                };
            }
            Err(crate::error::Error::ToolchainTimeout(d)) => {
                return timed_out_result(component, start, d);
            }
            Err(crate::error::Error::ToolchainMissing(name)) => {
                return missing_toolchain_result(component, start, name);
            }
            Err(crate::error::Error::Io(io_err)) => {
                attempts += 1;
                if attempts > inner.config.io_retry_budget {
                    return io_error_result(component, start, io_err);
                }
                let backoff = inner.config.io_retry_backoff * 4u32.pow(attempts - 1);
                warn!(attempts, ?backoff, "transient IO error during build, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(other) => {
                return io_error_result(component, start, std::io::Error::other(other.to_string()));
            }
        }
    }
}

async fn run_toolchain_pair(
    inner: &Arc<Inner>,
    component: &ComponentInfo,
    pool: &crate::pool::BytePool,
    allowlist: &std::collections::HashSet<std::path::PathBuf>,
) -> Result<(Vec<u8>, Vec<u8>, bool), crate::error::Error> {
    let generator_args = vec![
        "--component".to_string(),
        component.name.clone(),
        "--file".to_string(),
        component.file_path.display().to_string(),
    ];
    let generated = worker::run_allowlisted(
        &inner.toolchain.generator,
        &generator_args,
        allowlist,
        inner.config.toolchain_timeout,
        inner.config.output_cap_bytes,
        pool,
    )
    .await?;
    if !generated.success {
        return Ok((generated.stdout, generated.stderr, false));
    }

    let compiler_args = vec!["--component".to_string(), component.name.clone()];
    let compiled = worker::run_allowlisted(
        &inner.toolchain.compiler,
        &compiler_args,
        allowlist,
        inner.config.toolchain_timeout,
        inner.config.output_cap_bytes,
        pool,
    )
    .await?;

    pool.recycle(generated.stdout);
    pool.recycle(generated.stderr);

    Ok((compiled.stdout, compiled.stderr, compiled.success))
}

fn timed_out_result(component: &ComponentInfo, start: std::time::Instant, timeout: std::time::Duration) -> BuildResult {
    BuildResult {
        component_name: component.name.clone(),
        success: false,
        cached: false,
        duration: start.elapsed(),
        stdout: String::new(),
        stderr: format!("toolchain timed out after {timeout:?}"),
        error_kind: Some(BuildErrorKind::ToolchainTimeout),
        artifact_hash: None,
    }
}

fn missing_toolchain_result(component: &ComponentInfo, start: std::time::Instant, name: String) -> BuildResult {
    BuildResult {
        component_name: component.name.clone(),
        success: false,
        cached: false,
        duration: start.elapsed(),
        stdout: String::new(),
        stderr: format!("toolchain missing: {name}"),
        error_kind: Some(BuildErrorKind::ToolchainMissing),
        artifact_hash: None,
    }
}

/// A blake3 hex digest is always 64 lowercase hex characters.
fn is_valid_artifact_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn io_error_result(component: &ComponentInfo, start: std::time::Instant, err: std::io::Error) -> BuildResult {
    BuildResult {
        component_name: component.name.clone(),
        success: false,
        cached: false,
        duration: start.elapsed(),
        stdout: String::new(),
        stderr: err.to_string(),
        error_kind: Some(BuildErrorKind::IoError),
        artifact_hash: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_hash_is_64_hex_chars() {
        let hash = blake3::hash(b"anything").to_hex().to_string();
        assert!(is_valid_artifact_hash(&hash));
    }

    #[test]
    fn truncated_hash_is_invalid() {
        let hash = blake3::hash(b"anything").to_hex().to_string();
        assert!(!is_valid_artifact_hash(&hash[..32]));
    }

    #[test]
    fn non_hex_hash_is_invalid() {
        assert!(!is_valid_artifact_hash(&"z".repeat(64)));
    }

    #[test]
    fn worker_count_clamps_to_pipeline_bounds() {
        let mut config = PipelineConfig::default();
        config.worker_count = 1;
        let toolchain = ToolchainPaths {
            generator: std::path::PathBuf::from("/bin/true"),
            compiler: std::path::PathBuf::from("/bin/true"),
        };
        let pipeline = Pipeline::new(config, toolchain, "v1");
        let a = pipeline.inner.pool.shard(0) as *const crate::pool::BytePool;
        let b = pipeline.inner.pool.shard(2) as *const crate::pool::BytePool;
        assert_eq!(a, b);
    }
}
