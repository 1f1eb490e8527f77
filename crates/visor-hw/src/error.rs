//! Error types for hardware boundary operations

use thiserror::Error;

use crate::id::{StageId, StreamId};

/// Errors reported by hardware adapter implementations
///
/// All adapter operations return `Result<T, HwError>`. The scheduler
/// propagates these to the caller of the failing operation and runs its
/// cancellation path; it never retries an adapter call on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// A shot could not be issued to the stage
    #[error("shot failed on stage {stage} (code {code})")]
    ShotFailed {
        /// Stage the shot was addressed to
        stage: StageId,
        /// Adapter-specific failure code
        code: u32,
    },

    /// Stage start/stop control failed
    #[error("process control failed on stage {stage}: {reason}")]
    ProcessControl {
        /// Stage being controlled
        stage: StageId,
        /// Adapter-specific description
        reason: String,
    },

    /// Whole-stream on/off control failed
    #[error("stream control failed on stream {stream}: {reason}")]
    StreamControl {
        /// Stream being controlled
        stream: StreamId,
        /// Adapter-specific description
        reason: String,
    },

    /// Point-to-point link negotiation failed
    ///
    /// The scheduler resets any partially-established link state for the
    /// stage when it sees this.
    #[error("virtual-OTF link failed on stage {stage}: {reason}")]
    LinkFailed {
        /// Downstream stage of the link
        stage: StageId,
        /// Adapter-specific description
        reason: String,
    },

    /// The adapter rejected the stage as unknown or unbound
    #[error("stage {stage} is not bound on this adapter")]
    UnknownStage {
        /// Offending stage
        stage: StageId,
    },
}

/// Result type for hardware boundary operations
pub type Result<T> = std::result::Result<T, HwError>;
