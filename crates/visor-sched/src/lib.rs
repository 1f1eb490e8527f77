//! # visor-sched
//!
//! Scheduler core of the
//! [visor-pipeline](https://github.com/visor-dev/visor-pipeline) workspace:
//! frame lifecycle scheduling for multi-stage image pipelines.
//!
//! The [`GroupManager`] is the single entry point. It owns an arena of
//! [`Group`]s (one per stream × stage), a worker and admission semaphore
//! per physical stage, per-stream ordering ledgers for buffered
//! hand-offs, and a coordinator that arbitrates stages shared by
//! concurrent streams.
//!
//! # Architecture
//!
//! ```text
//!  consumer ──▶ buffer_queue ──▶ [worker task per stage]
//!                                     │ admission semaphore
//!                                     │ sensor trigger (sync stages)
//!                                     ▼
//!                               adapter.shot()
//!                                     │
//!  consumer ◀── done/finish ◀── completion (any task)
//! ```
//!
//! Frames move FREE→REQUEST→PROCESS→COMPLETE→FREE through queues owned by
//! segment heads; peer-input members share their head's queue and
//! hardware transaction. Stopping a started group runs a seven-phase
//! drain that always ends with clean state.

#![cfg_attr(docsrs, feature(doc_cfg))]

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod arena;
pub mod config;
pub mod error;
pub mod flow;
pub mod graph;
pub mod group;
pub mod manager;
pub mod shot;
pub mod sync;
pub mod task;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

pub use config::{SchedConfig, SchedConfigBuilder, TaskPriority};
pub use error::{Result, SchedError};
pub use flow::FlowLedger;
pub use group::{Group, GroupCounters, GroupFlag, GroupInput, GroupIx, GroupLinks, ShotBudget};
pub use manager::{GroupManager, RESULT_CANCELLED};
pub use sync::SyncCoordinator;
pub use task::{GroupTask, TaskFlag};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
