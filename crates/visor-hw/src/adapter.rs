//! Collaborator traits at the hardware boundary
//!
//! The scheduler drives hardware through [`HardwareAdapter`], observes the
//! external producer through [`Sensor`], and reports frame outcomes to the
//! frame-memory owner through [`BufferConsumer`]. Implementations live
//! outside this workspace (or in [`loopback`](crate::loopback) for pure
//! software runs).
//!
//! All trait methods are synchronous commands: `shot` queues work and
//! returns; the completion arrives later through the scheduler's `done`
//! entry point, typically from a different task than the worker that
//! issued the shot.

use visor_frame::ShotMeta;

use crate::error::Result;
use crate::id::{StageId, StreamId};

/// One unit of hardware work, as handed to the adapter
///
/// A view onto the dispatched frame: identity plus the control block. The
/// frame itself stays in its queue; the adapter refers back to it by
/// `stream`/`stage`/`index` when reporting completion.
#[derive(Debug, Clone)]
pub struct ShotRequest {
    /// Stream the frame belongs to
    pub stream: StreamId,
    /// Physical stage the work is addressed to
    pub stage: StageId,
    /// Frame index within the stage's queue
    pub index: u32,
    /// Frame sequence number stamped by the scheduler
    pub fcount: u32,
    /// Control block for this shot
    pub meta: ShotMeta,
}

/// Completion status delivered to the buffer consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
    /// Frame completed normally
    Done,
    /// Frame completed with an error (adapter or scheduler code)
    Error(u32),
}

impl DoneStatus {
    /// Whether this status carries an error
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, DoneStatus::Error(_))
    }
}

/// Programs processing IP blocks and reports stream-level control results
///
/// Implementations must be cheap to call from worker context: `shot`
/// enqueues work on the hardware and returns without waiting for the
/// result.
pub trait HardwareAdapter: Send + Sync {
    /// Issue one unit of hardware work for a stage
    fn shot(&self, request: &ShotRequest) -> Result<()>;

    /// Enable processing on a physical stage
    fn process_start(&self, stage: StageId) -> Result<()>;

    /// Stop processing on a physical stage
    ///
    /// `force` skips graceful quiescing; used by the drain protocol when a
    /// force-stop was requested.
    fn process_stop(&self, stage: StageId, force: bool) -> Result<()>;

    /// Start the whole stream pipeline
    fn stream_on(&self, stream: StreamId) -> Result<()>;

    /// Stop the whole stream pipeline
    fn stream_off(&self, stream: StreamId) -> Result<()>;
}

/// The external frame producer
///
/// The sensor generates frames asynchronously and independently of
/// consumer readiness; the scheduler only observes it. `current_fcount`
/// must be monotonic while streaming.
pub trait Sensor: Send + Sync {
    /// Sensor's own frame counter
    fn current_fcount(&self) -> u32;

    /// Active sensor width in pixels
    fn width(&self) -> u32;

    /// Active sensor height in pixels
    fn height(&self) -> u32;

    /// Whether the front end is producing frames
    fn is_streaming(&self) -> bool;

    /// Whether the sensor device is open at all
    ///
    /// The drain protocol escalates to a forced trigger immediately when
    /// the sensor is closed.
    fn is_open(&self) -> bool {
        true
    }

    /// Whether the back end (receiver side) has started
    fn is_back_started(&self) -> bool {
        self.is_streaming()
    }
}

/// The external owner of frame memory
///
/// Receives the terminal notification for every frame the scheduler
/// finishes, successful or not.
pub trait BufferConsumer: Send + Sync {
    /// A frame reached COMPLETE
    fn done(&self, stream: StreamId, stage: StageId, index: u32, status: DoneStatus);

    /// A shot finished with a non-zero hardware result
    ///
    /// Forwarded in addition to `done` so device-level bookkeeping can
    /// react to hardware errors; default implementation ignores it.
    fn shot_done(&self, stream: StreamId, stage: StageId, fcount: u32, result: u32) {
        let _ = (stream, stage, fcount, result);
    }
}

/// Optional point-to-point hardware link manager
///
/// Negotiates virtual-OTF links between stages that are not physically
/// adjacent, emulating on-the-fly transfer without intermediate
/// buffering.
pub trait VotfLinker: Send + Sync {
    /// Establish a link into `stage` at the given geometry
    fn create_link(&self, stage: StageId, width: u32, height: u32) -> Result<()>;

    /// Tear a previously created link down
    fn destroy_link(&self, stage: StageId) -> Result<()>;
}

/// No-op link manager for chains without the virtual-OTF IP
#[derive(Debug, Clone, Copy, Default)]
pub struct NullVotf;

impl VotfLinker for NullVotf {
    fn create_link(&self, _stage: StageId, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn destroy_link(&self, _stage: StageId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Slot;

    #[test]
    fn test_done_status() {
        assert!(!DoneStatus::Done.is_error());
        assert!(DoneStatus::Error(5).is_error());
    }

    #[test]
    fn test_shot_request_clone_keeps_identity() {
        let request = ShotRequest {
            stream: 1,
            stage: StageId::new(Slot::Stat, 0),
            index: 2,
            fcount: 42,
            meta: ShotMeta::default(),
        };
        let copy = request.clone();
        assert_eq!(copy.fcount, 42);
        assert_eq!(copy.stage, request.stage);
    }
}
