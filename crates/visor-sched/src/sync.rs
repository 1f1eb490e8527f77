//! Shared-task arbitration between concurrent streams
//!
//! A physical stage bound by more than one stream serves both a
//! latency-sensitive preview stream and latency-tolerant reprocessing
//! (capture) streams. Reprocessing work does not dispatch on arrival: it
//! parks here with a timestamp, and is drained either when preview work
//! dispatches on the same stage or when it has waited out one scheduling
//! quantum.
//!
//! Parked work never survives a stream stop; the drain protocol flushes
//! it back to the worker where the force-stop path cancels it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use visor_hw::{StageId, StreamId};

use crate::task::Work;

/// Reprocessing work waiting for a dispatch window
#[derive(Debug, Clone, Copy)]
pub(crate) struct Parked {
    /// Stream the work belongs to
    pub stream: StreamId,
    /// The deferred dispatch
    pub work: Work,
    parked_at: Instant,
}

/// Arbitration state for stages shared by concurrent streams
#[derive(Debug)]
pub struct SyncCoordinator {
    quantum: Duration,
    parked: Mutex<HashMap<StageId, Vec<Parked>>>,
}

impl SyncCoordinator {
    /// Create a coordinator with the given scheduling quantum
    #[must_use]
    pub fn new(quantum: Duration) -> Self {
        Self { quantum, parked: Mutex::new(HashMap::new()) }
    }

    /// Whether a dispatch must park instead of going to the worker
    ///
    /// Only reprocessing work on a memory-input head whose task is shared
    /// by another stream parks; everything else dispatches directly.
    #[must_use]
    pub fn should_park(&self, refcount: u32, reprocessing: bool, peer_input: bool) -> bool {
        refcount > 1 && reprocessing && !peer_input
    }

    /// Park reprocessing work on a shared stage
    pub(crate) fn park(&self, stage: StageId, stream: StreamId, work: Work) {
        debug!(stage = %stage, stream, index = work.index, "parking reprocessing work");
        self.parked
            .lock()
            .entry(stage)
            .or_default()
            .push(Parked { stream, work, parked_at: Instant::now() });
    }

    /// Parked entries for a stage
    #[must_use]
    pub fn parked_len(&self, stage: StageId) -> usize {
        self.parked.lock().get(&stage).map_or(0, Vec::len)
    }

    /// Preview dispatched on `stage`: everything parked there goes too
    pub(crate) fn drain_stage(&self, stage: StageId) -> Vec<Parked> {
        self.parked.lock().remove(&stage).unwrap_or_default()
    }

    /// Remove parked work belonging to `stream` (stop path)
    pub(crate) fn drain_stream(&self, stream: StreamId) -> Vec<(StageId, Parked)> {
        let mut drained = Vec::new();
        let mut parked = self.parked.lock();
        for (&stage, entries) in parked.iter_mut() {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if entry.stream == stream {
                    drained.push((stage, entry));
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
        }
        drained
    }

    /// Parked work that has outlived the quantum
    pub(crate) fn take_expired(&self) -> Vec<(StageId, Parked)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut parked = self.parked.lock();
        for (&stage, entries) in parked.iter_mut() {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if now.duration_since(entry.parked_at) >= self.quantum {
                    expired.push((stage, entry));
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
        }
        expired
    }
}
