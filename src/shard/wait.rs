//! Consistency-wait primitives: the wait request, the min-heap of pending
//! waiters, and the cancel signal.
//!
//! A cancel signal is a channel whose disconnect is the event: every
//! cloned receiver observes it, matching fan-out to many partitions.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::{NautexError, Result};

pub use crate::models::{LEVEL_ANY, LEVEL_AT_PLUS};

/// Receiver half of a cancel signal; fires when every sender is dropped.
pub type CancelRx = Receiver<()>;
/// Sender half of a cancel signal; drop it to cancel.
pub type CancelTx = Sender<()>;

/// A cancel signal pair. No message is ever sent on it.
pub fn cancel_pair() -> (CancelTx, CancelRx) {
    bounded(0)
}

/// A cancel signal that fires after `timeout_ms`.
pub fn cancel_after_ms(timeout_ms: u64) -> CancelRx {
    let (tx, rx) = bounded::<()>(0);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(timeout_ms));
        drop(tx);
    });
    rx
}

/// Has the cancel signal fired?
pub fn cancelled(cancel: &CancelRx) -> bool {
    matches!(
        cancel.try_recv(),
        Err(crossbeam::channel::TryRecvError::Disconnected)
    )
}

/// A request submitted to a partition's wait inbox.
pub struct WaitRequest {
    pub level: String,
    pub seq: u64,
    /// One-shot completion signal.
    pub done_tx: Sender<Result<()>>,
}

impl WaitRequest {
    pub fn new(level: &str, seq: u64) -> (Self, Receiver<Result<()>>) {
        let (done_tx, done_rx) = bounded(1);
        (
            Self {
                level: level.to_string(),
                seq,
                done_tx,
            },
            done_rx,
        )
    }
}

/// Block on the completion signal, racing it against the cancel signal
/// when one is supplied.
pub fn wait_done(done_rx: Receiver<Result<()>>, cancel: Option<CancelRx>) -> Result<()> {
    match cancel {
        Some(cancel_rx) => crossbeam::select! {
            recv(cancel_rx) -> _ => Err(NautexError::Cancelled),
            recv(done_rx) -> msg => msg.unwrap_or(Err(NautexError::ConsistencyClosed)),
        },
        None => done_rx.recv().unwrap_or(Err(NautexError::ConsistencyClosed)),
    }
}

/// A pending waiter parked until the partition's applied seq reaches `seq`.
pub(crate) struct PendingWait {
    pub seq: u64,
    pub done_tx: Sender<Result<()>>,
}

impl PartialEq for PendingWait {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingWait {}

impl PartialOrd for PendingWait {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingWait {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Min-heap of pending waiters, ordered by target seq ascending.
#[derive(Default)]
pub(crate) struct WaitQueue(BinaryHeap<Reverse<PendingWait>>);

impl WaitQueue {
    /// Park a waiter.
    pub fn push(&mut self, wait: PendingWait) {
        self.0.push(Reverse(wait));
    }

    /// Pop the next waiter whose target is covered by `seq_max_batch`.
    pub fn next_ready(&mut self, seq_max_batch: u64) -> Option<PendingWait> {
        if self
            .0
            .peek()
            .is_some_and(|Reverse(w)| w.seq <= seq_max_batch)
        {
            return self.0.pop().map(|Reverse(w)| w);
        }
        None
    }

    /// Remove every parked waiter, in target order.
    pub fn drain(&mut self) -> Vec<PendingWait> {
        let mut out = Vec::with_capacity(self.0.len());
        while let Some(Reverse(w)) = self.0.pop() {
            out.push(w);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
