//! Scheduler error types
//!
//! Four behavior classes, visible in the variants:
//!
//! - [`SchedError::StateViolation`] - synchronous rejection of a call made
//!   in the wrong lifecycle state; nothing changed, the caller's problem.
//! - [`SchedError::AdmissionInterrupted`] / [`SchedError::FlowDesync`] -
//!   the affected frame is cancelled (completed with error) and everything
//!   acquired for it is rolled back; the stream keeps running.
//! - [`SchedError::DrainTimeout`] - drain phases exhausted retries; the
//!   stop still completed and left clean state, the count is a report.
//! - [`SchedError::Hardware`] / [`SchedError::Consistency`] - propagated
//!   collaborator failures and the fatal bookkeeping class.

use thiserror::Error;
use visor_frame::ConsistencyError;
use visor_hw::{HwError, Slot, StageId, StreamId};

/// Errors reported by scheduler operations
#[derive(Error, Debug)]
pub enum SchedError {
    /// Operation called in the wrong lifecycle state
    ///
    /// Rejected synchronously; no state was changed.
    #[error("{slot}@{stream}: {reason}")]
    StateViolation {
        /// Stream the call addressed
        stream: StreamId,
        /// Logical stage the call addressed
        slot: Slot,
        /// What was wrong
        reason: String,
    },

    /// An admission wait was interrupted by a stop request
    ///
    /// The frame is completed with error status and every resource
    /// acquired for it is released.
    #[error("admission interrupted on stage {stage}")]
    AdmissionInterrupted {
        /// Stage whose admission was being waited on
        stage: StageId,
    },

    /// A buffered hand-off token could not be matched to its frame
    ///
    /// The frame is cancelled; the ledger has already been rewound past
    /// the stale tokens.
    #[error("flow ledger desync on stream {stream} at fcount {fcount}")]
    FlowDesync {
        /// Stream whose ledger desynced
        stream: StreamId,
        /// Frame count the shot carried
        fcount: u32,
    },

    /// Drain exhausted one or more phase retry budgets
    ///
    /// The stop still ran to completion and the group is stopped and
    /// clean; `errors` counts the phases (and leftover requests) that
    /// needed forcing.
    #[error("drain on {slot}@{stream} forced {errors} time(s)")]
    DrainTimeout {
        /// Stream being stopped
        stream: StreamId,
        /// Stage being stopped
        slot: Slot,
        /// Aggregate forced-phase count
        errors: u32,
    },

    /// A hardware collaborator call failed
    #[error(transparent)]
    Hardware(#[from] HwError),

    /// Frame or graph bookkeeping broke an invariant (fatal class)
    ///
    /// Must not be caught and retried; stop the stream that produced it.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

impl SchedError {
    pub(crate) fn state(stream: StreamId, slot: Slot, reason: impl Into<String>) -> Self {
        SchedError::StateViolation { stream, slot, reason: reason.into() }
    }
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;
