//! # visor-pipeline
//!
//! Frame lifecycle scheduling for multi-stage hardware image pipelines.
//!
//! This crate provides a unified interface to the visor pipeline libraries:
//!
//! - **[`frame`]** - The frame data unit and the four-bucket frame queue
//! - **[`hw`]** - Hardware collaborator boundary (adapter, sensor, consumer
//!   and virtual-OTF link traits, plus the software loopback adapter)
//! - **[`sched`]** - The scheduler: groups, stage workers, graph building,
//!   sensor synchronization, and the drain-safe stop protocol
//!
//! # Features
//!
//! All features are enabled by default. You can selectively enable only what you need:
//!
//! ```toml
//! # Use everything (default)
//! visor-pipeline = "0.2"
//!
//! # Frame types only
//! visor-pipeline = { version = "0.2", default-features = false, features = ["frame"] }
//!
//! # Frame types + hardware boundary
//! visor-pipeline = { version = "0.2", default-features = false, features = ["frame", "hw"] }
//!
//! # All features including sub-crate features
//! visor-pipeline = { version = "0.2", features = ["full"] }
//! ```
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `frame` | Yes | Frame data unit and queue |
//! | `hw`    | Yes | Hardware collaborator boundary |
//! | `sched` | Yes | Pipeline scheduler |
//! | `full`  | No  | All features from all sub-crates (includes the loopback adapter) |
//!
//! # Quick Start
//!
//! ## Building and running a pipeline
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use visor_pipeline::hw::{NullVotf, Slot, StageId};
//! use visor_pipeline::sched::{GroupInput, GroupManager, SchedConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the scheduler to its collaborators (adapter, sensor, consumer).
//!     let manager = GroupManager::new(
//!         SchedConfig::default(),
//!         adapter,
//!         sensor,
//!         consumer,
//!         Arc::new(NullVotf),
//!     );
//!
//!     // Declare the stream's stages and derive the pipeline graph.
//!     manager.open(0, Slot::Stat, StageId::new(Slot::Stat, 0))?;
//!     manager.open(0, Slot::Isp, StageId::new(Slot::Isp, 0))?;
//!     manager.init(0, Slot::Stat, GroupInput::Memory, true)?;
//!     manager.init(0, Slot::Isp, GroupInput::Otf, false)?;
//!     manager.build(0)?;
//!
//!     // Start and feed frames.
//!     manager.start(0, Slot::Stat)?;
//!     manager.start(0, Slot::Isp)?;
//!     manager.start_stream(0)?;
//!     manager.buffer_queue(0, Slot::Stat, 0, Default::default())?;
//!
//!     // Completions arrive through BufferConsumer::done; finished frames
//!     // return with buffer_finish. Stopping drains everything.
//!     manager.stop(0, Slot::Stat).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Hardware-free runs with the loopback adapter
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use visor_pipeline::hw::LoopbackAdapter;
//!
//! // With the `full` feature: completes every shot after 5 ms.
//! let (adapter, completions) = LoopbackAdapter::new(Duration::from_millis(5));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        visor-pipeline                           │
//! ├─────────────────┬─────────────────────┬─────────────────────────┤
//! │   visor-frame   │     visor-hw        │      visor-sched        │
//! │                 │                     │                         │
//! │  Frame          │  HardwareAdapter    │  GroupManager           │
//! │  FrameQueue     │  Sensor             │  Group / GroupTask      │
//! │  ShotMeta       │  BufferConsumer     │  FlowLedger             │
//! │  FrameState     │  StageId / Slot     │  SchedConfig            │
//! └────────┬────────┴──────────┬──────────┴────────────┬────────────┘
//!          │                   │                       │
//!          ▼                   ▼                       ▼
//!    Frame lifecycle     Processing IPs          Dispatch policy
//! ```
//!
//! # Related Crates
//!
//! You can also use the individual crates directly:
//!
//! - [`visor-frame`](https://crates.io/crates/visor-frame) - Frame types only
//! - [`visor-hw`](https://crates.io/crates/visor-hw) - Hardware boundary only
//! - [`visor-sched`](https://crates.io/crates/visor-sched) - Scheduler only

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// RE-EXPORTS
// =============================================================================

/// The frame data unit and the four-bucket frame queue.
///
/// This module provides the pipeline's unit of work:
/// - The FREE/REQUEST/PROCESS/COMPLETE lifecycle and its legal transitions
/// - The ordered multi-state frame queue with consistency checking
/// - Per-shot control and telemetry blocks
///
/// See [`visor_frame`] documentation for details.
#[cfg(feature = "frame")]
#[cfg_attr(docsrs, doc(cfg(feature = "frame")))]
pub use visor_frame as frame;

/// Hardware collaborator boundary.
///
/// This module defines everything below the shot level:
/// - [`HardwareAdapter`](visor_hw::HardwareAdapter) for issuing hardware work
/// - [`Sensor`](visor_hw::Sensor) observations of the external producer
/// - [`BufferConsumer`](visor_hw::BufferConsumer) completion notifications
/// - Stage identity ([`StageId`](visor_hw::StageId), [`Slot`](visor_hw::Slot))
/// - The software loopback adapter (with the `loopback` sub-crate feature)
///
/// See [`visor_hw`] documentation for details.
#[cfg(feature = "hw")]
#[cfg_attr(docsrs, doc(cfg(feature = "hw")))]
pub use visor_hw as hw;

/// The pipeline scheduler.
///
/// This module provides the scheduling core:
/// - Group lifecycle (open/init/build/start/stop) and the group arena
/// - Per-stage workers with semaphore admission control
/// - Sensor-synchronized dispatch and the flow ledger
/// - The drain-safe stop protocol
///
/// See [`visor_sched`] documentation for details.
#[cfg(feature = "sched")]
#[cfg_attr(docsrs, doc(cfg(feature = "sched")))]
pub use visor_sched as sched;

// =============================================================================
// PRELUDE - Common types for convenience
// =============================================================================

/// Prelude module with commonly used types.
///
/// ```rust
/// use visor_pipeline::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "frame")]
    pub use visor_frame::{Frame, FrameQueue, FrameState, ShotMeta};

    #[cfg(feature = "hw")]
    pub use visor_hw::{
        BufferConsumer, DoneStatus, HardwareAdapter, NullVotf, Sensor, ShotRequest, Slot, StageId,
        StreamId,
    };

    #[cfg(feature = "sched")]
    pub use visor_sched::{GroupInput, GroupManager, SchedConfig, SchedError};
}
