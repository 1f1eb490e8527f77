//! The frame: one unit of pipeline work
//!
//! A frame is exclusively owned by its [`FrameQueue`](crate::FrameQueue)
//! and moves between the four state buckets by explicit transition, never
//! by duplication. Everything else on it is payload the scheduler stamps
//! or reads: sequence counters, the output-owed bitmask, and the per-shot
//! control/telemetry block.

use crate::queue::QueueCounts;

/// Lifecycle state of a frame
///
/// Exactly one at a time. Transitions are owned by the queue and only the
/// cyclic order FREE→REQUEST→PROCESS→COMPLETE→FREE is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Owned by the consumer; not visible to the scheduler
    Free,
    /// Queued for dispatch, not yet admitted to hardware
    Request,
    /// Admitted; hardware work is in flight
    Process,
    /// Hardware finished (or the frame was cancelled); awaiting finish
    Complete,
}

impl FrameState {
    /// The only state this one may legally transition into
    #[must_use]
    pub fn successor(self) -> FrameState {
        match self {
            FrameState::Free => FrameState::Request,
            FrameState::Request => FrameState::Process,
            FrameState::Process => FrameState::Complete,
            FrameState::Complete => FrameState::Free,
        }
    }

    /// Bucket index used by the queue internals
    #[must_use]
    pub(crate) fn bucket(self) -> usize {
        match self {
            FrameState::Free => 0,
            FrameState::Request => 1,
            FrameState::Process => 2,
            FrameState::Complete => 3,
        }
    }
}

/// Auto-exposure mode carried on a shot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeMode {
    /// Exposure chosen by the pipeline
    #[default]
    On,
    /// Manual exposure: the consumer's values are authoritative
    Off,
}

/// Flash control mode carried on a shot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    /// No flash activity
    #[default]
    Off,
    /// Continuous torch
    Torch,
    /// Single capture firing
    Capture,
}

/// Per-frame control and telemetry block
///
/// The control half is stamped by the consumer when the frame is queued;
/// the sensor-request override copies the latency-sensitive fields onto a
/// look-back window of still-queued frames so a manual-exposure change
/// reaches the sensor before the frame it is meant to affect. The
/// telemetry half is written back on completion.
#[derive(Debug, Clone, Default)]
pub struct ShotMeta {
    /// Auto-exposure mode for this frame
    pub ae_mode: AeMode,
    /// Manual exposure time in nanoseconds (honored when `ae_mode` is Off)
    pub exposure_time_ns: u64,
    /// Frame duration in nanoseconds
    pub frame_duration_ns: u64,
    /// Analog sensitivity
    pub sensitivity: u32,
    /// Vendor ISO value (honored when `ae_mode` is Off)
    pub iso_value: u32,
    /// Exposure compensation steps
    pub ae_compensation: i32,
    /// Auto-exposure lock
    pub ae_lock: bool,
    /// Flash mode for this frame
    pub flash_mode: FlashMode,
    /// Optical stabilization enable
    pub ois_enabled: bool,

    /// White-balance gains reported by the last completed shot (R, Gr, Gb, B)
    pub wb_gains: [f32; 4],
    /// Noise index of the current frame, tagged on completion
    pub noise_index_current: u32,
    /// Predicted noise index two frames ahead, tagged on completion
    pub noise_index_next: u32,
}

/// Stripe-iteration metadata, opaque to the scheduler
///
/// The scheduler only looks at `region_num`/`region_id` to decide whether a
/// completed pass re-triggers dispatch for the remaining stripes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripeInfo {
    /// Total stripe regions for this frame (0 = no striping)
    pub region_num: u32,
    /// Region the current pass covers
    pub region_id: u32,
}

impl StripeInfo {
    /// Whether another pass remains after the current one
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.region_num > 0 && self.region_id + 1 < self.region_num
    }
}

/// Repeat-shot metadata for multi-pass stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatInfo {
    /// Passes still owed after the current completion
    pub remaining: u32,
}

/// One unit of pipeline work
///
/// Owned by exactly one [`FrameQueue`](crate::FrameQueue); its `state`
/// field is private to the crate so that bucket membership and recorded
/// state can never drift apart.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Identity within the owning queue
    pub index: u32,
    /// Monotonic per-stream frame count, stamped by the scheduler
    pub fcount: u32,
    /// Request count carried from the consumer
    pub rcount: u32,
    /// Status of the last hardware attempt (0 = success)
    pub result: u32,
    /// Bitmask of downstream sub-entries still owing output
    pub out_flag: u64,
    /// `out_flag` as latched at dispatch, for settle checks
    pub bak_flag: u64,
    /// Stripe-iteration metadata
    pub stripe: StripeInfo,
    /// Repeat-shot metadata, if this frame runs multiple passes
    pub repeat: Option<RepeatInfo>,
    /// Control/telemetry block
    pub meta: ShotMeta,
    /// Bucket counts recorded at the last COMPLETE→FREE transition
    pub queue_counts: QueueCounts,
    pub(crate) state: FrameState,
}

impl Frame {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            fcount: 0,
            rcount: 0,
            result: 0,
            out_flag: 0,
            bak_flag: 0,
            stripe: StripeInfo::default(),
            repeat: None,
            meta: ShotMeta::default(),
            queue_counts: QueueCounts::default(),
            state: FrameState::Free,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Set the output-owed bit for a sub-entry
    pub fn set_out_bit(&mut self, entry: u32) {
        self.out_flag |= 1 << entry;
    }

    /// Clear the output-owed bit for a sub-entry
    pub fn clear_out_bit(&mut self, entry: u32) {
        self.out_flag &= !(1 << entry);
    }

    /// Whether a sub-entry still owes output for this frame
    #[must_use]
    pub fn owes_output(&self, entry: u32) -> bool {
        self.out_flag & (1 << entry) != 0
    }

    /// Latch the current `out_flag` for later settle checks
    pub fn latch_out_flag(&mut self) {
        self.bak_flag = self.out_flag;
    }
}
