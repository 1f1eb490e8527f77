//! # visor-frame
//!
//! Frame data unit and the four-bucket frame queue used by the
//! [visor-pipeline](https://github.com/visor-dev/visor-pipeline) scheduler.
//!
//! A [`Frame`] is the unit of work flowing through a hardware image
//! pipeline. At any instant it belongs to exactly one state bucket of
//! exactly one [`FrameQueue`]:
//!
//! ```text
//! FREE ──queue──▶ REQUEST ──dispatch──▶ PROCESS ──complete──▶ COMPLETE
//!   ▲                                                            │
//!   └────────────────────────── finish ──────────────────────────┘
//! ```
//!
//! Any other transition is a [`ConsistencyError`], the fatal error class
//! of the pipeline. The queue never recovers from one; callers stop the
//! stream rather than retry, since continuing risks silent frame
//! corruption.
//!
//! # Examples
//!
//! ```rust
//! use visor_frame::{FrameQueue, FrameState};
//!
//! let mut queue = FrameQueue::new(0, 4);
//! queue.transition(0, FrameState::Request)?;
//! queue.transition(0, FrameState::Process)?;
//! queue.transition(0, FrameState::Complete)?;
//! queue.transition(0, FrameState::Free)?;
//!
//! assert_eq!(queue.queued_count(FrameState::Free), 4);
//! # Ok::<(), visor_frame::ConsistencyError>(())
//! ```
//!
//! # Ownership model
//!
//! A queue is owned by the head stage of a pipeline segment; downstream
//! stages of the same segment share it through a back-reference. The queue
//! itself is not synchronized; the owner wraps it in a short-held lock
//! because completion notifications arrive from a different task than the
//! worker dequeuing frames.

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod error;
pub mod frame;
pub mod queue;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

pub use error::ConsistencyError;
pub use frame::{AeMode, FlashMode, Frame, FrameState, RepeatInfo, ShotMeta, StripeInfo};
pub use queue::{FrameQueue, QueueCounts};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
