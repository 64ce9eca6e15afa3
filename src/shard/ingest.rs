//! Per-partition ingest state machine: batching, sequence tracking, and
//! consistency waits.

use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::wait::{PendingWait, WaitQueue, WaitRequest, LEVEL_ANY, LEVEL_AT_PLUS};
use crate::config::IngestSettings;
use crate::engine::{EngineBatch, IndexEngine};
use crate::error::{NautexError, Result};

/// Observable progress of a partition's ingest pipeline.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct IngestProgress {
    /// Highest seq observed for this partition.
    pub seq_max: u64,
    /// Highest seq that got through batch apply.
    pub seq_max_batch: u64,
    /// Upper bound of the current snapshot.
    pub seq_snap_end: u64,
    /// Waiters parked until `seq_max_batch` advances.
    pub pending_waits: usize,
}

struct IngestState {
    seq_max: u64,
    seq_max_batch: u64,
    seq_snap_end: u64,
    // The pending batch holds refcounted slices split off this buffer, so
    // values stay valid until the apply completes.
    buf: BytesMut,
    batch: EngineBatch,
    last_opaque: Option<Bytes>,
    waits: WaitQueue,
}

impl IngestState {
    fn append_to_buf(&mut self, value: &[u8]) -> Bytes {
        if value.is_empty() {
            return Bytes::new();
        }
        self.buf.reserve(value.len());
        self.buf.extend_from_slice(value);
        self.buf.split().freeze()
    }
}

/// Tracks ingest state for a single partition.
///
/// All mutation, seq-update, batch-apply and opaque accesses are
/// serialized by the state mutex. Wait intake runs on a dedicated worker
/// draining a single-slot inbox; an oversubscribed submitter blocks until
/// the worker catches up.
pub struct PartitionIngest {
    partition: String,
    /// Internal key for the persisted seq high-water mark.
    seq_key: Bytes,
    /// Internal key for the upstream opaque blob.
    opaque_key: Bytes,
    settings: IngestSettings,
    state: Mutex<IngestState>,
    wait_tx: Mutex<Option<Sender<WaitRequest>>>,
}

impl PartitionIngest {
    pub(crate) fn spawn(partition: &str, settings: IngestSettings) -> Result<Arc<Self>> {
        let (wait_tx, wait_rx) = bounded(1);

        let ingest = Arc::new(Self {
            partition: partition.to_string(),
            seq_key: Bytes::copy_from_slice(partition.as_bytes()),
            opaque_key: Bytes::from(format!("o:{partition}")),
            state: Mutex::new(IngestState {
                seq_max: 0,
                seq_max_batch: 0,
                seq_snap_end: 0,
                buf: BytesMut::with_capacity(settings.initial_buf_bytes),
                batch: EngineBatch::new(),
                last_opaque: None,
                waits: WaitQueue::default(),
            }),
            settings,
            wait_tx: Mutex::new(Some(wait_tx)),
        });

        let worker = Arc::clone(&ingest);
        thread::Builder::new()
            .name(format!("wait-{partition}"))
            .spawn(move || worker.run_waits(wait_rx))?;

        Ok(ingest)
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn progress(&self) -> IngestProgress {
        let state = self.state.lock();
        IngestProgress {
            seq_max: state.seq_max,
            seq_max_batch: state.seq_max_batch,
            seq_snap_end: state.seq_snap_end,
            pending_waits: state.waits.len(),
        }
    }

    pub fn on_update(
        &self,
        engine: &dyn IndexEngine,
        key: &[u8],
        seq: u64,
        value: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let value = state.append_to_buf(value);
        state
            .batch
            .index(String::from_utf8_lossy(key).into_owned(), value);
        self.update_seq_locked(&mut state, engine, seq)
    }

    pub fn on_delete(&self, engine: &dyn IndexEngine, key: &[u8], seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.batch.delete(String::from_utf8_lossy(key).into_owned());
        self.update_seq_locked(&mut state, engine, seq)
    }

    /// A snapshot boundary is a safe flush point: apply whatever is
    /// pending, then track the new snapshot's upper bound.
    pub fn on_snapshot_start(
        &self,
        engine: &dyn IndexEngine,
        snap_start: u64,
        snap_end: u64,
    ) -> Result<()> {
        debug!(
            partition = %self.partition,
            snap_start,
            snap_end,
            "snapshot start"
        );
        let mut state = self.state.lock();
        self.apply_batch_locked(&mut state, engine)?;
        state.seq_snap_end = snap_end;
        Ok(())
    }

    pub fn set_opaque(&self, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let opaque = Bytes::copy_from_slice(value);
        state.last_opaque = Some(opaque.clone());
        state.batch.set_internal(self.opaque_key.clone(), opaque);
        Ok(())
    }

    /// Returns the cached opaque blob and seq high-water mark, reading
    /// through to the engine's internal keys when the cache is cold.
    pub fn get_opaque(&self, engine: &dyn IndexEngine) -> Result<(Bytes, u64)> {
        let mut state = self.state.lock();

        if state.last_opaque.is_none() {
            let value = engine.get_internal(&self.opaque_key)?;
            state.last_opaque = Some(value.unwrap_or_default());
        }

        if state.seq_max == 0 {
            if let Some(buf) = engine.get_internal(&self.seq_key)? {
                // No persisted seq is a valid case; any other non-8 length is not.
                if !buf.is_empty() {
                    if buf.len() != 8 {
                        return Err(NautexError::Corrupt(buf.len()));
                    }
                    let mut be = [0u8; 8];
                    be.copy_from_slice(&buf[..8]);
                    state.seq_max = u64::from_be_bytes(be);
                }
            }
        }

        Ok((
            state.last_opaque.clone().unwrap_or_default(),
            state.seq_max,
        ))
    }

    /// Submit a wait to the intake worker. Blocks while the single-slot
    /// inbox is full; errors once the inbox has been closed.
    pub(crate) fn enqueue_wait(&self, req: WaitRequest) -> Result<()> {
        let guard = self.wait_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(req)
                .map_err(|_| NautexError::ConsistencyClosed),
            None => Err(NautexError::ConsistencyClosed),
        }
    }

    /// Close the wait inbox; the worker drains parked waiters with a
    /// close error and exits.
    pub(crate) fn close_waits(&self) {
        self.wait_tx.lock().take();
    }

    fn run_waits(&self, wait_rx: Receiver<WaitRequest>) {
        for req in wait_rx.iter() {
            let mut state = self.state.lock();
            match req.level.as_str() {
                LEVEL_ANY => {
                    // Stale reads are fine, nothing to wait for.
                    let _ = req.done_tx.send(Ok(()));
                }
                LEVEL_AT_PLUS => {
                    if req.seq > state.seq_max_batch {
                        state.waits.push(PendingWait {
                            seq: req.seq,
                            done_tx: req.done_tx,
                        });
                    } else {
                        let _ = req.done_tx.send(Ok(()));
                    }
                }
                level => {
                    let _ = req
                        .done_tx
                        .send(Err(NautexError::ConsistencyUnsupported(level.to_string())));
                }
            }
        }

        // Inbox closed: the shard is going down, so error out anyone
        // still parked.
        let mut state = self.state.lock();
        for wait in state.waits.drain() {
            let _ = wait.done_tx.send(Err(NautexError::ConsistencyClosed));
        }
    }

    fn update_seq_locked(
        &self,
        state: &mut IngestState,
        engine: &dyn IndexEngine,
        seq: u64,
    ) -> Result<()> {
        if seq > state.seq_max {
            state.seq_max = seq;
            let seq_max = state.seq_max;
            state.batch.set_internal(
                self.seq_key.clone(),
                Bytes::copy_from_slice(&seq_max.to_be_bytes()),
            );
        }

        if state.batch.value_bytes() < self.settings.apply_buf_bytes
            && seq < state.seq_snap_end
        {
            return Ok(());
        }

        self.apply_batch_locked(state, engine)
    }

    fn apply_batch_locked(&self, state: &mut IngestState, engine: &dyn IndexEngine) -> Result<()> {
        // On failure the batch is kept as-is; the next trigger retries it.
        engine.apply_batch(&state.batch)?;

        state.seq_max_batch = state.seq_max;

        let seq_max_batch = state.seq_max_batch;
        while let Some(wait) = state.waits.next_ready(seq_max_batch) {
            // A send can fail only when the waiter already went away
            // (cancelled); the done signal is one-shot either way.
            let _ = wait.done_tx.send(Ok(()));
        }

        state.batch = EngineBatch::new();

        // seq_snap_end stays untouched: a size-triggered apply does not
        // end the snapshot.
        Ok(())
    }
}
