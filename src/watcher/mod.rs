//! File watcher: debouncing, batching, and backpressure.
//!
//! Turns raw `notify` filesystem events into ordered, deduplicated, bounded
//! `ChangeBatch` values (`spec.md` §4.1). `notify` supplies the raw OS event
//! source only — the debounce/batch/coalesce/backpressure policy is owned
//! here so its semantics (LRU-drop-25%, hard ceiling, rename modelling) are
//! exact rather than whatever `notify`'s own debouncer happens to do.

mod debounce;

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::pool::VecPool;
use crate::types::{ChangeBatch, ChangeEvent, ChangeKind};
use debounce::{Debouncer, FlushReason};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;
pub type ChangeHandler = Arc<dyn Fn(ChangeBatch) + Send + Sync>;

/// Directories ignored regardless of user filters, per `spec.md` §6.
const IGNORED_DIR_NAMES: &[&str] = &[".git", ".hg", ".svn", "node_modules", "target", "vendor"];

fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        IGNORED_DIR_NAMES.contains(&s.as_ref())
    })
}

/// A batch-dropped notification, surfaced alongside (not instead of)
/// delivered batches so callers can track backpressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropStats {
    pub paths_dropped: u64,
}

/// Capacity of the shelf backing `Inner::batch_pool` — bounded so a burst of
/// distinct batch sizes can't pin an unbounded number of `Vec`s in memory.
const BATCH_POOL_SHELF: usize = 32;

struct Inner {
    config: WatcherConfig,
    roots: Mutex<Vec<PathBuf>>,
    filters: Mutex<Vec<PathFilter>>,
    handlers: Mutex<Vec<ChangeHandler>>,
    error_handlers: Mutex<Vec<Arc<dyn Fn(Error) + Send + Sync>>>,
    sequence: AtomicU64,
    drops: AtomicU64,
    /// Reused `Vec<ChangeEvent>` buffers for flushed batches — acquired on
    /// flush, released once every handler has seen the batch.
    batch_pool: VecPool<ChangeEvent>,
    /// Bounded handoff to the dispatch task. Its capacity is
    /// `C_out` (`output_capacity`): the number of flushed-but-undelivered
    /// batches the watcher tolerates before degrading, not a per-batch path
    /// count (a single flush is already capped at `max_batch_size`).
    batch_tx: mpsc::Sender<ChangeBatch>,
}

/// Turns raw filesystem notifications into ordered, deduplicated, bounded
/// batches of interesting changes.
pub struct Watcher {
    inner: Arc<Inner>,
    notify_watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    batch_rx: Mutex<Option<mpsc::Receiver<ChangeBatch>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(config: WatcherConfig) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(config.output_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                roots: Mutex::new(Vec::new()),
                filters: Mutex::new(Vec::new()),
                handlers: Mutex::new(Vec::new()),
                error_handlers: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                drops: AtomicU64::new(0),
                batch_pool: VecPool::new(BATCH_POOL_SHELF),
                batch_tx,
            }),
            notify_watcher: Mutex::new(None),
            task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            batch_rx: Mutex::new(Some(batch_rx)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Begin watching a directory recursively. Fails with `InvalidPath` if
    /// the path doesn't exist; the root itself defines the escape boundary
    /// used by `resolve_under_root` for every event path.
    pub fn add_root(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let resolved = std::fs::canonicalize(path).map_err(|_| Error::InvalidPath(path.to_path_buf()))?;
        if !resolved.is_dir() {
            return Err(Error::InvalidPath(path.to_path_buf()));
        }
        self.inner.roots.lock().expect("roots poisoned").push(resolved);
        Ok(())
    }

    /// Register a path predicate. Filters are ANDed.
    pub fn add_filter(&self, predicate: impl Fn(&Path) -> bool + Send + Sync + 'static) {
        self.inner
            .filters
            .lock()
            .expect("filters poisoned")
            .push(Arc::new(predicate));
    }

    /// Register a sink receiving flushed `ChangeBatch` values. Multiple
    /// handlers are allowed and are invoked in registration order.
    pub fn add_handler(&self, handler: impl Fn(ChangeBatch) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .expect("handlers poisoned")
            .push(Arc::new(handler));
    }

    /// Register a sink for watcher errors other than "watch removed".
    pub fn add_error_handler(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        self.inner
            .error_handlers
            .lock()
            .expect("error handlers poisoned")
            .push(Arc::new(handler));
    }

    /// Total paths dropped under backpressure since the watcher started.
    pub fn dropped_count(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    /// Start watching. Installs OS watch handles for every registered root
    /// and spawns the debounce/dispatch task. Dropped (not awaited) on
    /// `Stop`, which is guaranteed to release the OS handles.
    pub fn start(&self) -> Result<()> {
        let roots = self.inner.roots.lock().expect("roots poisoned").clone();
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

        let mut notify_watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res| {
                let _ = raw_tx.send(res);
            })?;

        for root in &roots {
            notify_watcher.watch(root, RecursiveMode::Recursive)?;
        }

        let (async_tx, async_rx) = mpsc::channel::<notify::Result<Event>>(self.inner.config.input_capacity);
        // Bridge the synchronous notify callback into the async world via a
        // dedicated blocking thread — notify's callback can fire from any OS
        // thread and must never block.
        std::thread::spawn(move || {
            while let Ok(res) = raw_rx.recv() {
                if async_tx.blocking_send(res).is_err() {
                    break;
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(run_event_loop(inner, async_rx, shutdown_rx));

        if let Some(batch_rx) = self.batch_rx.lock().expect("batch rx poisoned").take() {
            let inner = Arc::clone(&self.inner);
            let dispatch_handle = tokio::spawn(run_dispatch_loop(inner, batch_rx));
            *self.dispatch_task.lock().expect("dispatch task poisoned") = Some(dispatch_handle);
        }

        *self.notify_watcher.lock().expect("notify watcher poisoned") = Some(notify_watcher);
        *self.task.lock().expect("task poisoned") = Some(handle);
        info!(roots = roots.len(), "watcher started");
        Ok(())
    }

    /// Stop the watcher. Idempotent — calling `stop` after `stop` is a
    /// no-op. Releases OS watch handles on every exit path.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().expect("task poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.dispatch_task.lock().expect("dispatch task poisoned").take() {
            handle.abort();
        }
        self.notify_watcher.lock().expect("notify watcher poisoned").take();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let cfg = inner.config.clone();
    let mut debouncer = Debouncer::new(cfg.debounce_window, cfg.max_batch_size, cfg.hard_ceiling);
    let mut rearm_retries = 0u32;

    loop {
        let wake = debouncer
            .next_wake()
            .map(tokio::time::sleep_until)
            .unwrap_or_else(|| tokio::time::sleep(std::time::Duration::from_secs(3600)));
        tokio::pin!(wake);

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe_event = raw_rx.recv() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        handle_raw_event(&inner, &mut debouncer, event);
                    }
                    Some(Err(err)) => {
                        if is_watch_removed(&err) && rearm_retries < cfg.rearm_retry_budget {
                            rearm_retries += 1;
                            warn!(retries = rearm_retries, "watch removed, auto-rearming");
                        } else {
                            dispatch_error(&inner, Error::Watch(err));
                        }
                    }
                    None => break,
                }
            }
            _ = &mut wake => {
                // fall through to the flush check below
            }
        }

        if let Some(reason) = debouncer.should_flush() {
            flush_and_dispatch(&inner, &mut debouncer, reason);
        }
    }
}

fn try_record(inner: &Arc<Inner>, filters: &[PathFilter], debouncer: &mut Debouncer, path: PathBuf, kind: ChangeKind) {
    if is_ignored_path(&path) {
        return;
    }
    if !filters.iter().all(|f| f(&path)) {
        return;
    }
    let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst);
    let change_event = ChangeEvent {
        path,
        kind,
        sequence,
        timestamp: std::time::SystemTime::now(),
    };
    debouncer.record(change_event);
}

fn handle_raw_event(inner: &Arc<Inner>, debouncer: &mut Debouncer, event: Event) {
    let filters = inner.filters.lock().expect("filters poisoned").clone();

    // Renames are modelled as `removed(old)` + `created(new)` rather than a
    // single opaque "renamed" marker, per `spec.md` §4.1 step 5.
    if let EventKind::Modify(notify::event::ModifyKind::Name(mode)) = event.kind {
        use notify::event::RenameMode;
        let mut paths = event.paths.into_iter();
        match mode {
            RenameMode::Both => {
                if let Some(old) = paths.next() {
                    try_record(inner, &filters, debouncer, old, ChangeKind::Removed);
                }
                if let Some(new) = paths.next() {
                    try_record(inner, &filters, debouncer, new, ChangeKind::Created);
                }
            }
            RenameMode::From => {
                for path in paths {
                    try_record(inner, &filters, debouncer, path, ChangeKind::Removed);
                }
            }
            RenameMode::To => {
                for path in paths {
                    try_record(inner, &filters, debouncer, path, ChangeKind::Created);
                }
            }
            RenameMode::Any | RenameMode::Other => {
                // notify couldn't pair the old/new halves for us; fall back
                // to a single renamed marker rather than guessing.
                for path in paths {
                    try_record(inner, &filters, debouncer, path, ChangeKind::Renamed);
                }
            }
        }
        return;
    }

    let Some(kind) = classify(&event.kind) else {
        return;
    };
    for path in event.paths {
        try_record(inner, &filters, debouncer, path, kind);
    }
}

fn flush_and_dispatch(inner: &Arc<Inner>, debouncer: &mut Debouncer, _reason: FlushReason) {
    if debouncer.is_empty() {
        return;
    }
    let mut batch = debouncer.flush_into(inner.batch_pool.acquire());
    if batch.is_empty() {
        return;
    }

    // Hand off through the bounded dispatch channel. Its capacity is
    // `output_capacity` *batches*, not paths-per-batch — a single flush is
    // already capped at `max_batch_size`, so gating on path count here could
    // never trigger under the default config. If the dispatch task has
    // fallen behind and the channel is full, degrade by dropping the oldest
    // 25% of this batch and retrying rather than blocking the filesystem
    // source.
    loop {
        match inner.batch_tx.try_send(batch) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                batch = returned;
                let dropped = drop_oldest(&mut batch, 0.25);
                inner.drops.fetch_add(dropped as u64, Ordering::Relaxed);
                warn!(dropped, "watcher output backpressure, dropped oldest paths");
                if batch.is_empty() {
                    inner.batch_pool.release(batch.events);
                    return;
                }
            }
            Err(TrySendError::Closed(returned)) => {
                inner.batch_pool.release(returned.events);
                return;
            }
        }
    }
}

fn drop_oldest(batch: &mut ChangeBatch, fraction: f64) -> usize {
    let drop_count = ((batch.events.len() as f64) * fraction).ceil() as usize;
    let drop_count = drop_count.min(batch.events.len());
    batch.events.drain(0..drop_count);
    drop_count
}

async fn run_dispatch_loop(inner: Arc<Inner>, mut batch_rx: mpsc::Receiver<ChangeBatch>) {
    while let Some(batch) = batch_rx.recv().await {
        let handlers = inner.handlers.lock().expect("handlers poisoned").clone();
        for handler in &handlers {
            handler(batch.clone());
        }
        inner.batch_pool.release(batch.events);
    }
}

fn dispatch_error(inner: &Arc<Inner>, err: Error) {
    let handlers = inner.error_handlers.lock().expect("error handlers poisoned").clone();
    if handlers.is_empty() {
        warn!(error = %err, "unhandled watcher error");
    }
    for handler in handlers {
        handler(Error::Io(std::io::Error::other(err.to_string())));
    }
}

fn is_watch_removed(err: &notify::Error) -> bool {
    matches!(err.kind, notify::ErrorKind::WatchNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{ModifyKind, RenameMode};
    use std::time::Duration;

    #[test]
    fn add_root_rejects_missing_path() {
        let watcher = Watcher::new(WatcherConfig::default());
        let err = watcher.add_root("/no/such/path/templar-test");
        assert!(matches!(err, Err(Error::InvalidPath(_))));
    }

    fn inner_for_test() -> Arc<Inner> {
        let (batch_tx, _batch_rx) = mpsc::channel(8);
        Arc::new(Inner {
            config: WatcherConfig::default(),
            roots: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            batch_pool: VecPool::new(BATCH_POOL_SHELF),
            batch_tx,
        })
    }

    #[test]
    fn rename_both_splits_into_removed_and_created() {
        let inner = inner_for_test();
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 50, Duration::from_secs(10));

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("old.tmpl"))
            .add_path(PathBuf::from("new.tmpl"));
        handle_raw_event(&inner, &mut debouncer, event);

        let batch = debouncer.flush();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.events[0].path, PathBuf::from("old.tmpl"));
        assert_eq!(batch.events[0].kind, ChangeKind::Removed);
        assert_eq!(batch.events[1].path, PathBuf::from("new.tmpl"));
        assert_eq!(batch.events[1].kind, ChangeKind::Created);
    }

    #[test]
    fn rename_from_and_to_are_split_across_events() {
        let inner = inner_for_test();
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 50, Duration::from_secs(10));

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from("old.tmpl"));
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("new.tmpl"));
        handle_raw_event(&inner, &mut debouncer, from);
        handle_raw_event(&inner, &mut debouncer, to);

        let batch = debouncer.flush();
        assert_eq!(batch.len(), 2);
        assert!(batch
            .events
            .iter()
            .any(|e| e.path == PathBuf::from("old.tmpl") && e.kind == ChangeKind::Removed));
        assert!(batch
            .events
            .iter()
            .any(|e| e.path == PathBuf::from("new.tmpl") && e.kind == ChangeKind::Created));
    }

    #[test]
    fn batch_buffer_is_reused_across_flush_cycles() {
        let inner = inner_for_test();
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 50, Duration::from_secs(10));
        debouncer.record(ChangeEvent {
            path: PathBuf::from("a.tmpl"),
            kind: ChangeKind::Created,
            sequence: 1,
            timestamp: std::time::SystemTime::now(),
        });

        let batch = debouncer.flush_into(inner.batch_pool.acquire());
        assert_eq!(batch.len(), 1);
        let cap = batch.events.capacity();
        inner.batch_pool.release(batch.events);

        let reused = inner.batch_pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), cap);
    }

    #[test]
    fn flush_and_dispatch_releases_buffer_when_dispatch_channel_is_closed() {
        let inner = inner_for_test();
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 50, Duration::from_secs(10));
        debouncer.record(ChangeEvent {
            path: PathBuf::from("a.tmpl"),
            kind: ChangeKind::Created,
            sequence: 1,
            timestamp: std::time::SystemTime::now(),
        });

        // `inner_for_test` drops the receiver, so this exercises the
        // channel-closed path rather than a successful handoff — it must not
        // panic, and the pooled buffer must come back for reuse.
        flush_and_dispatch(&inner, &mut debouncer, FlushReason::BatchFull);
        let buf = inner.batch_pool.acquire();
        assert!(buf.is_empty());
    }
}
