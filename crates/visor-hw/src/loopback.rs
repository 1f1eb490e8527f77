//! Software loopback adapter
//!
//! Completes every shot after a configurable latency on a tokio task, so
//! whole pipelines run without hardware. Completions are delivered on a
//! channel; the harness forwards them into the scheduler's `done` entry
//! point, which reproduces the real topology where completion arrives
//! from a different context than the worker that issued the shot.
//!
//! # Examples
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use visor_hw::LoopbackAdapter;
//!
//! let (adapter, mut completions) = LoopbackAdapter::new(Duration::from_millis(5));
//!
//! tokio::spawn(async move {
//!     while let Some(shot) = completions.recv().await {
//!         // forward to GroupManager::done(...)
//!     }
//! });
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::{HardwareAdapter, ShotRequest};
use crate::error::{HwError, Result};
use crate::id::{StageId, StreamId};

/// Pure software hardware backend
///
/// Every accepted shot is echoed on the completion channel after the
/// configured latency. Shots can be made to fail per stage with
/// [`fail_next`](LoopbackAdapter::fail_next), which the error-path tests
/// use.
pub struct LoopbackAdapter {
    latency: Duration,
    completions: mpsc::UnboundedSender<ShotRequest>,
    shots_issued: AtomicU32,
    in_flight: Arc<AtomicU32>,
    max_in_flight: Arc<AtomicU32>,
    /// Stages whose next shot should be rejected, with the error code
    fail_plan: Mutex<Vec<(StageId, u32)>>,
}

impl LoopbackAdapter {
    /// Create an adapter and its completion channel
    pub fn new(latency: Duration) -> (Self, mpsc::UnboundedReceiver<ShotRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                latency,
                completions: tx,
                shots_issued: AtomicU32::new(0),
                in_flight: Arc::new(AtomicU32::new(0)),
                max_in_flight: Arc::new(AtomicU32::new(0)),
                fail_plan: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Total shots accepted so far
    #[must_use]
    pub fn shots_issued(&self) -> u32 {
        self.shots_issued.load(Ordering::Relaxed)
    }

    /// Highest number of shots in flight at once
    #[must_use]
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    /// Make the next shot on `stage` fail with `code`
    pub fn fail_next(&self, stage: StageId, code: u32) {
        self.fail_plan.lock().push((stage, code));
    }

    fn planned_failure(&self, stage: StageId) -> Option<u32> {
        let mut plan = self.fail_plan.lock();
        let pos = plan.iter().position(|&(s, _)| s == stage)?;
        Some(plan.remove(pos).1)
    }
}

impl HardwareAdapter for LoopbackAdapter {
    fn shot(&self, request: &ShotRequest) -> Result<()> {
        if let Some(code) = self.planned_failure(request.stage) {
            warn!(stage = %request.stage, code, "loopback: planned shot failure");
            return Err(HwError::ShotFailed { stage: request.stage, code });
        }

        self.shots_issued.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(now, Ordering::Relaxed);
        debug!(stage = %request.stage, fcount = request.fcount, "loopback: shot accepted");

        let tx = self.completions.clone();
        let latency = self.latency;
        let in_flight = Arc::clone(&self.in_flight);
        let completed = request.clone();
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
            // Receiver gone means the harness shut down first; fine.
            let _ = tx.send(completed);
        });
        Ok(())
    }

    fn process_start(&self, stage: StageId) -> Result<()> {
        debug!(stage = %stage, "loopback: process start");
        Ok(())
    }

    fn process_stop(&self, stage: StageId, force: bool) -> Result<()> {
        debug!(stage = %stage, force, "loopback: process stop");
        Ok(())
    }

    fn stream_on(&self, stream: StreamId) -> Result<()> {
        debug!(stream, "loopback: stream on");
        Ok(())
    }

    fn stream_off(&self, stream: StreamId) -> Result<()> {
        debug!(stream, "loopback: stream off");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Slot;
    use visor_frame::ShotMeta;

    fn request(stage: StageId, fcount: u32) -> ShotRequest {
        ShotRequest { stream: 0, stage, index: 0, fcount, meta: ShotMeta::default() }
    }

    #[tokio::test]
    async fn test_shot_completes_on_channel() {
        let (adapter, mut rx) = LoopbackAdapter::new(Duration::ZERO);
        let stage = StageId::new(Slot::Isp, 0);

        adapter.shot(&request(stage, 7)).expect("shot accepted");
        let done = rx.recv().await.expect("completion");
        assert_eq!(done.fcount, 7);
        assert_eq!(adapter.shots_issued(), 1);
    }

    #[tokio::test]
    async fn test_planned_failure_consumed_once() {
        let (adapter, mut rx) = LoopbackAdapter::new(Duration::ZERO);
        let stage = StageId::new(Slot::Stat, 1);

        adapter.fail_next(stage, 99);
        let err = adapter.shot(&request(stage, 1)).expect_err("planned failure");
        assert_eq!(err, HwError::ShotFailed { stage, code: 99 });

        adapter.shot(&request(stage, 2)).expect("next shot passes");
        assert_eq!(rx.recv().await.expect("completion").fcount, 2);
    }
}
