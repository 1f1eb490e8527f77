//! Consistency errors for frame bookkeeping
//!
//! These are the fatal class of the pipeline: a frame observed in a state
//! the bookkeeping says it cannot be in. They are surfaced through the
//! normal `Result` channel so the process keeps running, but they must not
//! be caught and retried: the stream that produced one is stopped.

use thiserror::Error;

use crate::frame::FrameState;

/// A frame-queue invariant was broken
///
/// Unlike ordinary scheduler errors, a `ConsistencyError` means the
/// bookkeeping itself is no longer trustworthy. Callers should tear the
/// affected stream down; retrying the operation risks double-completing
/// or losing a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// Transition not in the FREE→REQUEST→PROCESS→COMPLETE→FREE cycle
    #[error("illegal frame transition: frame {index} {from:?} -> {to:?}")]
    IllegalTransition {
        /// Frame index within its queue
        index: u32,
        /// State the frame is currently in
        from: FrameState,
        /// Requested target state
        to: FrameState,
    },

    /// Frame index outside the queue's capacity
    #[error("frame index {index} out of range (capacity {capacity})")]
    UnknownIndex {
        /// Offending index
        index: u32,
        /// Number of frames the queue owns
        capacity: u32,
    },

    /// A frame's recorded state disagrees with its bucket membership
    ///
    /// This can only happen through a bookkeeping bug, never through a
    /// caller mistake.
    #[error("frame {index} missing from its {state:?} bucket")]
    BucketMismatch {
        /// Frame index within its queue
        index: u32,
        /// State bucket the frame claims to occupy
        state: FrameState,
    },

    /// A structural invariant outside the queue was broken
    ///
    /// Used by the pipeline graph builder for unresolvable links; same
    /// fatal class as the queue variants.
    #[error("invariant broken: {detail}")]
    Invariant {
        /// What was observed
        detail: String,
    },
}

/// Result type for frame-queue operations
pub type Result<T> = std::result::Result<T, ConsistencyError>;
