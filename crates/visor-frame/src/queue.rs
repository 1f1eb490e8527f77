//! Four-bucket frame queue
//!
//! Ordered container partitioning its frames into the four lifecycle
//! buckets. Buckets preserve FIFO order; `peek`/`peek_tail` are O(1) and
//! `find` is a bounded linear scan used by cancellation.
//!
//! The queue carries no lock of its own. The owning stage wraps it in a
//! short-held mutex, because completion notifications mutate it from a
//! different task than the worker. The lock is never held across a
//! blocking call.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::{ConsistencyError, Result};
use crate::frame::{Frame, FrameState};

/// Snapshot of the per-bucket frame counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Frames in FREE
    pub free: u32,
    /// Frames in REQUEST
    pub request: u32,
    /// Frames in PROCESS
    pub process: u32,
    /// Frames in COMPLETE
    pub complete: u32,
}

/// Ordered multi-state frame container
///
/// All frames are allocated up front; they move between buckets by
/// [`transition`](FrameQueue::transition) and are never created or
/// destroyed while the queue lives.
#[derive(Debug)]
pub struct FrameQueue {
    id: u32,
    frames: Vec<Frame>,
    buckets: [VecDeque<u32>; 4],
}

impl FrameQueue {
    /// Create a queue with `capacity` frames, all FREE
    #[must_use]
    pub fn new(id: u32, capacity: u32) -> Self {
        let frames = (0..capacity).map(Frame::new).collect();
        let mut buckets: [VecDeque<u32>; 4] = Default::default();
        buckets[FrameState::Free.bucket()] = (0..capacity).collect();
        Self { id, frames, buckets }
    }

    /// Queue identity (matches the owning stage)
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total number of frames the queue owns
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Number of frames currently in `state`
    #[must_use]
    pub fn queued_count(&self, state: FrameState) -> u32 {
        self.buckets[state.bucket()].len() as u32
    }

    /// Per-bucket counts snapshot
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            free: self.queued_count(FrameState::Free),
            request: self.queued_count(FrameState::Request),
            process: self.queued_count(FrameState::Process),
            complete: self.queued_count(FrameState::Complete),
        }
    }

    /// Borrow a frame by index
    pub fn frame(&self, index: u32) -> Result<&Frame> {
        self.frames
            .get(index as usize)
            .ok_or(ConsistencyError::UnknownIndex { index, capacity: self.capacity() })
    }

    /// Mutably borrow a frame by index
    pub fn frame_mut(&mut self, index: u32) -> Result<&mut Frame> {
        let capacity = self.capacity();
        self.frames
            .get_mut(index as usize)
            .ok_or(ConsistencyError::UnknownIndex { index, capacity })
    }

    /// Move a frame to `target`, enforcing the legal cycle
    ///
    /// Only FREE→REQUEST, REQUEST→PROCESS, PROCESS→COMPLETE and
    /// COMPLETE→FREE are accepted; anything else is a
    /// [`ConsistencyError::IllegalTransition`]. A COMPLETE→FREE transition
    /// records the post-transition bucket counts onto the frame for the
    /// consumer to read back.
    pub fn transition(&mut self, index: u32, target: FrameState) -> Result<()> {
        let capacity = self.capacity();
        let frame = self
            .frames
            .get_mut(index as usize)
            .ok_or(ConsistencyError::UnknownIndex { index, capacity })?;
        let from = frame.state;

        if from.successor() != target {
            return Err(ConsistencyError::IllegalTransition { index, from, to: target });
        }

        let bucket = &mut self.buckets[from.bucket()];
        let pos = bucket
            .iter()
            .position(|&i| i == index)
            .ok_or(ConsistencyError::BucketMismatch { index, state: from })?;
        bucket.remove(pos);

        self.frames[index as usize].state = target;
        self.buckets[target.bucket()].push_back(index);

        if target == FrameState::Free {
            let counts = self.counts();
            self.frames[index as usize].queue_counts = counts;
        }
        Ok(())
    }

    /// Complete a frame straight out of REQUEST
    ///
    /// The one transition outside the cycle, reserved for cancellation: a
    /// frame that never reached hardware is finished with an error without
    /// passing through PROCESS. A PROCESS frame goes through
    /// [`transition`](FrameQueue::transition) as usual.
    pub fn force_complete(&mut self, index: u32) -> Result<()> {
        let capacity = self.capacity();
        let frame = self
            .frames
            .get_mut(index as usize)
            .ok_or(ConsistencyError::UnknownIndex { index, capacity })?;
        let from = frame.state;
        if from != FrameState::Request {
            return Err(ConsistencyError::IllegalTransition {
                index,
                from,
                to: FrameState::Complete,
            });
        }

        let bucket = &mut self.buckets[from.bucket()];
        let pos = bucket
            .iter()
            .position(|&i| i == index)
            .ok_or(ConsistencyError::BucketMismatch { index, state: from })?;
        bucket.remove(pos);

        self.frames[index as usize].state = FrameState::Complete;
        self.buckets[FrameState::Complete.bucket()].push_back(index);
        Ok(())
    }

    /// Head frame of a bucket, without removal
    #[must_use]
    pub fn peek(&self, state: FrameState) -> Option<&Frame> {
        let index = *self.buckets[state.bucket()].front()?;
        self.frames.get(index as usize)
    }

    /// Tail frame of a bucket, without removal
    #[must_use]
    pub fn peek_tail(&self, state: FrameState) -> Option<&Frame> {
        let index = *self.buckets[state.bucket()].back()?;
        self.frames.get(index as usize)
    }

    /// First frame in a bucket satisfying `predicate`, in FIFO order
    #[must_use]
    pub fn find<P>(&self, state: FrameState, predicate: P) -> Option<&Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        self.buckets[state.bucket()]
            .iter()
            .filter_map(|&i| self.frames.get(i as usize))
            .find(|frame| predicate(frame))
    }

    /// Indices of a bucket in FIFO order
    #[must_use]
    pub fn indices(&self, state: FrameState) -> Vec<u32> {
        self.buckets[state.bucket()].iter().copied().collect()
    }

    /// Apply `f` to the most recent `depth` REQUEST frames, newest first
    ///
    /// Look-back support for the sensor-request override: a control change
    /// on the newly queued frame is copied onto a bounded window of frames
    /// that are queued but not yet dispatched.
    pub fn for_each_request_tail<F>(&mut self, depth: u32, mut f: F)
    where
        F: FnMut(&mut Frame),
    {
        let bucket = self.buckets[FrameState::Request.bucket()].clone();
        for &index in bucket.iter().rev().take(depth as usize) {
            if let Some(frame) = self.frames.get_mut(index as usize) {
                f(frame);
            }
        }
    }

    /// Verify bucket membership matches recorded frame states
    ///
    /// Cheap enough to run in tests and after drain; a mismatch is the
    /// fatal class.
    pub fn check_consistency(&self) -> Result<()> {
        for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
            for &index in bucket {
                let frame = self.frame(index)?;
                if frame.state.bucket() != bucket_idx {
                    return Err(ConsistencyError::BucketMismatch { index, state: frame.state });
                }
            }
        }
        let total: usize = self.buckets.iter().map(VecDeque::len).sum();
        if total != self.frames.len() {
            warn!(queue = self.id, total, owned = self.frames.len(), "bucket population mismatch");
            // A frame missing from every bucket shows up as the first
            // orphan found by the scan below.
            for frame in &self.frames {
                if !self.buckets[frame.state.bucket()].contains(&frame.index) {
                    return Err(ConsistencyError::BucketMismatch {
                        index: frame.index,
                        state: frame.state,
                    });
                }
            }
        }
        Ok(())
    }
}
