//! Integration tests for the partitioned ingest pipeline: batching,
//! snapshot boundaries, consistency waits, and rollback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver};
use nautex::config::{IndexMapping, IngestSettings};
use nautex::engine::{IndexEngine, MemoryEngine};
use nautex::shard::{cancel_pair, IndexShard};
use nautex::{NautexError, Result};
use tempfile::TempDir;

fn new_shard(dir: &TempDir) -> (Arc<IndexShard>, Arc<AtomicUsize>) {
    let path = dir.path().join("shard0");
    let engine = MemoryEngine::new_index(&path, IndexMapping::default()).unwrap();
    let restarts = Arc::new(AtomicUsize::new(0));
    let hook_restarts = Arc::clone(&restarts);
    let shard = IndexShard::new(
        path,
        Arc::new(engine),
        IngestSettings::default(),
        Arc::new(move || {
            hook_restarts.fetch_add(1, Ordering::SeqCst);
        }),
    );
    (Arc::new(shard), restarts)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached in time");
}

fn spawn_wait(
    shard: &Arc<IndexShard>,
    partition: &str,
    level: &str,
    seq: u64,
) -> Receiver<Result<()>> {
    let shard = Arc::clone(shard);
    let partition = partition.to_string();
    let level = level.to_string();
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(shard.consistency_wait(&partition, &level, seq, None));
    });
    rx
}

#[test]
fn test_basic_apply_at_snapshot_end() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    shard.on_snapshot_start("0", 1, 5).unwrap();
    shard.on_update("0", b"k1", 3, b"v1").unwrap();
    assert_eq!(shard.progress()["0"].seq_max_batch, 0);

    shard.on_update("0", b"k2", 5, b"v2").unwrap();

    let progress = shard.progress()["0"];
    assert_eq!(progress.seq_max, 5);
    assert_eq!(progress.seq_max_batch, 5);
    assert!(progress.seq_max_batch <= progress.seq_max);
    assert_eq!(shard.count().unwrap(), 2);

    // The applied seq high-water mark is co-committed with the data.
    let persisted = shard
        .engine_handle()
        .unwrap()
        .get_internal(b"0")
        .unwrap()
        .unwrap();
    assert_eq!(persisted.as_ref(), &5u64.to_be_bytes());
}

#[test]
fn test_wait_satisfied_by_flush() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    let waiter = {
        let shard = Arc::clone(&shard);
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let result = shard.consistency_wait("0", "at_plus", 5, None);
            // Completion must be observed only once the applied seq covers
            // the target.
            let seq_max_batch = shard.progress()["0"].seq_max_batch;
            let _ = tx.send((result, seq_max_batch));
        });
        rx
    };

    wait_until(|| shard.progress().get("0").map(|p| p.pending_waits) == Some(1));

    shard.on_snapshot_start("0", 1, 5).unwrap();
    shard.on_update("0", b"k1", 3, b"v1").unwrap();
    shard.on_update("0", b"k2", 5, b"v2").unwrap();

    let (result, seq_max_batch) = waiter.recv_timeout(Duration::from_secs(5)).unwrap();
    result.unwrap();
    assert!(seq_max_batch >= 5);
}

#[test]
fn test_wait_cancelled() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    let (cancel_tx, cancel_rx) = cancel_pair();
    let waiter = {
        let shard = Arc::clone(&shard);
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = tx.send(shard.consistency_wait("0", "at_plus", 100, Some(cancel_rx)));
        });
        rx
    };

    wait_until(|| shard.progress().get("0").map(|p| p.pending_waits) == Some(1));
    drop(cancel_tx);

    let result = waiter.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(NautexError::Cancelled)));

    // An apply covering the target pops the stale entry; its one-shot done
    // signal goes nowhere.
    shard.on_snapshot_start("0", 1, 100).unwrap();
    shard.on_update("0", b"k", 100, b"v").unwrap();
    assert_eq!(shard.progress()["0"].pending_waits, 0);
}

#[test]
fn test_rollback_empties_shard() {
    let dir = TempDir::new().unwrap();
    let (shard, restarts) = new_shard(&dir);
    let path = shard.path().to_path_buf();

    shard.on_snapshot_start("0", 1, 5).unwrap();
    shard.on_update("0", b"k1", 3, b"v1").unwrap();
    shard.on_update("0", b"k2", 5, b"v2").unwrap();

    let waiter = spawn_wait(&shard, "0", "at_plus", 100);
    wait_until(|| shard.progress().get("0").map(|p| p.pending_waits) == Some(1));

    shard.rollback("0", 0).unwrap();

    assert_eq!(restarts.load(Ordering::SeqCst), 1);
    assert!(!path.exists());
    assert!(matches!(shard.count(), Err(NautexError::AlreadyClosed)));

    let result = waiter.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(NautexError::ConsistencyClosed)));
}

#[test]
fn test_size_flush_mid_snapshot() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    shard.on_snapshot_start("0", 1, 1_000_000).unwrap();

    // 300,000 bytes of updates crosses the apply threshold well before the
    // snapshot's end seq.
    let value = vec![b'x'; 10_000];
    for seq in 1..=30u64 {
        let key = format!("k{seq}");
        shard.on_update("0", key.as_bytes(), seq, &value).unwrap();
    }

    let progress = shard.progress()["0"];
    assert!(progress.seq_max_batch > 0);
    assert!(progress.seq_max_batch <= progress.seq_max);
    // A size-triggered apply does not end the snapshot.
    assert_eq!(progress.seq_snap_end, 1_000_000);
    assert!(shard.count().unwrap() > 0);
}

#[test]
fn test_unsupported_level() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    let err = shard
        .consistency_wait("0", "strong", 1, None)
        .unwrap_err();
    assert!(matches!(err, NautexError::ConsistencyUnsupported(level) if level == "strong"));
}

#[test]
fn test_level_any_returns_immediately() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);
    shard.consistency_wait("0", "", 1_000, None).unwrap();
}

#[test]
fn test_waiters_release_in_target_order() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);

    let w1 = spawn_wait(&shard, "0", "at_plus", 1);
    let w2 = spawn_wait(&shard, "0", "at_plus", 2);
    let w3 = spawn_wait(&shard, "0", "at_plus", 3);
    wait_until(|| shard.progress().get("0").map(|p| p.pending_waits) == Some(3));

    shard.on_snapshot_start("0", 1, 2).unwrap();
    shard.on_update("0", b"k1", 1, b"v1").unwrap();
    shard.on_update("0", b"k2", 2, b"v2").unwrap();

    // The apply at seq 2 releases exactly the waiters it covers.
    w1.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    w2.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(shard.progress()["0"].pending_waits, 1);
    assert!(w3.try_recv().is_err());

    // seq 3 is past the snapshot end, so it applies immediately.
    shard.on_update("0", b"k3", 3, b"v3").unwrap();
    w3.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
}

#[test]
fn test_opaque_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shard0");

    {
        let engine = MemoryEngine::new_index(&path, IndexMapping::default()).unwrap();
        let shard = IndexShard::new(
            &path,
            Arc::new(engine),
            IngestSettings::default(),
            Arc::new(|| {}),
        );

        shard.set_opaque("0", b"stream-resume-token").unwrap();
        shard.on_snapshot_start("0", 1, 2).unwrap();
        shard.on_update("0", b"k", 2, b"v").unwrap();
        shard.close().unwrap();
    }

    // A reopen clears every in-memory cache; both internal keys must come
    // back from the engine.
    let engine = MemoryEngine::open_index(&path).unwrap();
    let shard = IndexShard::new(
        &path,
        Arc::new(engine),
        IngestSettings::default(),
        Arc::new(|| {}),
    );

    let (opaque, seq_max) = shard.get_opaque("0").unwrap();
    assert_eq!(opaque.as_ref(), b"stream-resume-token");
    assert_eq!(seq_max, 2);
}

#[test]
fn test_rollback_hides_prior_events_after_rebuild() {
    let dir = TempDir::new().unwrap();
    let (shard, _) = new_shard(&dir);
    let path = shard.path().to_path_buf();

    shard.on_snapshot_start("0", 1, 1).unwrap();
    shard.on_update("0", b"doomed", 1, b"pale ale").unwrap();
    assert_eq!(shard.count().unwrap(), 1);

    shard.rollback("0", 0).unwrap();

    // The supervisor rebuilds from zero; nothing delivered before the
    // rollback is visible.
    let engine = MemoryEngine::new_index(&path, IndexMapping::default()).unwrap();
    let rebuilt = IndexShard::new(
        &path,
        Arc::new(engine),
        IngestSettings::default(),
        Arc::new(|| {}),
    );
    assert_eq!(rebuilt.count().unwrap(), 0);
}
