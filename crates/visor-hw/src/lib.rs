//! # visor-hw
//!
//! Hardware collaborator boundary for the
//! [visor-pipeline](https://github.com/visor-dev/visor-pipeline) scheduler.
//!
//! The scheduler never touches registers. Everything below the shot level
//! goes through four traits defined here:
//!
//! - [`HardwareAdapter`] - issue one unit of hardware work per stage and
//!   start/stop the physical stages and streams
//! - [`Sensor`] - the external producer: monotonic frame counter, geometry
//!   and streaming observations
//! - [`BufferConsumer`] - the external frame-memory owner, notified on
//!   every frame completion
//! - [`VotfLinker`] - optional software-negotiated point-to-point link
//!   between non-adjacent stages ([`NullVotf`] for chains without the IP)
//!
//! Stage identity ([`StageId`], [`Slot`], [`StreamId`]) also lives here so
//! both the scheduler and adapter implementations speak the same
//! vocabulary.
//!
//! # Loopback adapter
//!
//! With the `loopback` feature, [`LoopbackAdapter`] provides a pure
//! software backend that completes every shot after a configurable latency
//! on a tokio task. Integration tests and demos run whole pipelines
//! against it without hardware.

#![cfg_attr(docsrs, feature(doc_cfg))]

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod adapter;
pub mod error;
pub mod id;

#[cfg(feature = "loopback")]
#[cfg_attr(docsrs, doc(cfg(feature = "loopback")))]
pub mod loopback;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

pub use adapter::{
    BufferConsumer, DoneStatus, HardwareAdapter, NullVotf, Sensor, ShotRequest, VotfLinker,
};
pub use error::{HwError, Result};
pub use id::{Slot, StageId, StreamId, MAX_CHANNELS};

#[cfg(feature = "loopback")]
pub use loopback::LoopbackAdapter;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_null_votf() {
        let votf = NullVotf;
        let stage = StageId::new(Slot::Isp, 0);
        votf.create_link(stage, 1920, 1080).expect("noop create");
        votf.destroy_link(stage).expect("noop destroy");
    }
}
