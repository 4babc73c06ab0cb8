//! End-to-end coverage for watcher output backpressure
//! (`spec.md` §8 scenario 5).
//!
//! The output channel gates on *undelivered batches*, not paths-per-batch —
//! a single flush is already capped at `max_batch_size`. To exercise the
//! drop-oldest-25% path we need a consumer that has genuinely fallen behind,
//! so the handler here blocks the dispatch task until the test has seen a
//! drop, while flushes keep producing new batches on a separate task.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use templar::config::WatcherConfig;
use templar::Watcher;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_consumer_drops_oldest_batches_under_default_batch_size() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = WatcherConfig::default();
    // Keep the default batch-size/window shape (a single flush stays
    // well under output_capacity); only output_capacity is shrunk so a
    // stalled consumer saturates it without needing an enormous event count.
    config.output_capacity = 4;
    config.debounce_window = Duration::from_millis(20);
    config.hard_ceiling = Duration::from_millis(200);

    let watcher = Watcher::new(config);
    watcher.add_root(dir.path()).unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicUsize::new(0));
    let handler_release = Arc::clone(&release);
    let handler_delivered = Arc::clone(&delivered);
    watcher.add_handler(move |batch| {
        // Block the dispatch task on the very first batch until the test
        // releases it, forcing every later flush to queue up behind a
        // consumer that isn't draining.
        while !handler_release.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        handler_delivered.fetch_add(batch.len(), Ordering::SeqCst);
    });

    watcher.start().unwrap();

    for i in 0..2_000 {
        let path = dir.path().join(format!("gen-{i}.tmpl"));
        tokio::fs::write(&path, "package widgets\n").await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        watcher.dropped_count() > 0,
        "expected backpressure to drop paths once the stalled consumer exceeded output_capacity"
    );

    release.store(true, Ordering::Release);
    tokio::time::sleep(Duration::from_millis(50)).await;
    watcher.stop();
}
