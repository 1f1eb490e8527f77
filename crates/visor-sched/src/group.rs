//! Pipeline stage state
//!
//! A [`Group`] is one pipeline stage of one stream: its lifecycle flags,
//! shot counters, graph links, and (for segment heads) the frame queue.
//! Groups live in the manager's arena and reference each other only by
//! [`GroupIx`], never by pointer, so link rebuilds cannot create cycles of
//! ownership.
//!
//! Orthogonal condition flags are an `enumflags2` set; the mutually
//! exclusive lifecycle phase is not a flag but the Open/Init/Start
//! progression checked by the manager's operations.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use tokio::sync::Notify;
use visor_frame::FrameQueue;
use visor_hw::{Slot, StageId, StreamId};

/// Arena index of a group
///
/// Stable for the group's open-to-close lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupIx(pub(crate) usize);

/// Orthogonal group condition flags
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFlag {
    /// Bound to a task and registered in the arena
    Open,
    /// Input mode and leader role configured
    Init,
    /// Accepting and dispatching frames
    Start,
    /// A shot is in progress on this group's worker
    Shot,
    /// Caller asked the coming stop to skip graceful quiescing
    RequestForceStop,
    /// Drain escalated; in-flight shots must cancel
    ForceStop,
    /// Fed peer-to-peer by the upstream stage
    OtfInput,
    /// Feeds the downstream stage peer-to-peer
    OtfOutput,
    /// Fed through a software-negotiated point-to-point link
    VotfInput,
    /// Feeds through a software-negotiated point-to-point link
    VotfOutput,
    /// A point-to-point link is currently established
    VotfConnLink,
    /// Parked by chain rebinding; shots cancel immediately
    Standby,
    /// Member of a duplicated parallel chain
    MultiChannel,
}

/// How a group receives its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupInput {
    /// Buffered hand-off through memory
    #[default]
    Memory,
    /// On-the-fly from the physically adjacent upstream stage
    Otf,
    /// Virtual on-the-fly over a negotiated link
    Votf,
}

/// Shot admission parameters, computed at group start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShotBudget {
    /// Shots that may run ahead of the sensor
    pub asyn: u32,
    /// Sensor-synchronized shots
    pub sync: u32,
    /// Initial settle frames to skip reporting for
    pub skip: u32,
    /// Bootstrap shots dispatched before the sensor front end starts
    pub init: u32,
}

impl ShotBudget {
    /// Total admission budget
    #[must_use]
    pub fn total(&self) -> u32 {
        self.asyn + self.sync
    }
}

/// Graph links of a group, all by arena index
///
/// Rebuilt on every stream (re)build. `next`/`prev` is declaration order;
/// the builder derives the rest: `child`/`parent` for peer-to-peer
/// continuations, `gnext`/`gprev` for buffered segment hand-offs,
/// `pnext`/`ptail` for the duplicated parallel chain, and `head`/`tail`
/// for the segment this group belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupLinks {
    /// Next group in declaration order
    pub next: Option<GroupIx>,
    /// Previous group in declaration order
    pub prev: Option<GroupIx>,
    /// Peer-to-peer continuation downstream
    pub child: Option<GroupIx>,
    /// Peer-to-peer continuation upstream
    pub parent: Option<GroupIx>,
    /// Next segment head downstream (buffered hand-off)
    pub gnext: Option<GroupIx>,
    /// Previous segment head upstream
    pub gprev: Option<GroupIx>,
    /// Head of the duplicated parallel chain
    pub pnext: Option<GroupIx>,
    /// Tail of the duplicated parallel chain
    pub ptail: Option<GroupIx>,
    /// Head of this group's segment
    pub head: Option<GroupIx>,
    /// Tail of this group's segment
    pub tail: Option<GroupIx>,
}

/// Counter snapshot of a group, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCounters {
    /// Leader frame sequence
    pub fcount: u32,
    /// Program counter
    pub pcount: u32,
    /// Shots issued
    pub scount: u32,
    /// Outstanding consumer requests
    pub rcount: u32,
    /// Sensor-synchronized frame counter
    pub sensor_fcount: u32,
    /// Last fcount handed to a dispatched shot
    pub backup_fcount: u32,
    /// Available-shot level
    pub smp_shot: i32,
}

/// One pipeline stage of one stream
#[derive(Debug)]
pub struct Group {
    ix: GroupIx,
    stream: StreamId,
    slot: Slot,
    id: Mutex<StageId>,
    flags: Mutex<BitFlags<GroupFlag>>,
    input: Mutex<GroupInput>,
    shots: Mutex<ShotBudget>,
    links: Mutex<GroupLinks>,
    queue: Mutex<Option<Arc<Mutex<FrameQueue>>>>,
    size: Mutex<(u32, u32)>,

    /// Leader frame sequence; never regresses for a synchronized stage
    pub(crate) fcount: AtomicU32,
    /// Program counter, diagnostics only
    pub(crate) pcount: AtomicU32,
    /// Shots issued
    pub(crate) scount: AtomicU32,
    /// Outstanding consumer requests
    pub(crate) rcount: AtomicU32,
    /// Sensor-synchronized frame counter
    pub(crate) sensor_fcount: AtomicU32,
    /// Last fcount handed to a dispatched shot
    pub(crate) backup_fcount: AtomicU32,
    /// Available-shot level, mirrors the admission semaphore
    pub(crate) smp_shot: AtomicI32,

    /// Sensor-synchronization wake-up, distinct from admission
    pub(crate) trigger: Notify,
    /// Shots currently parked on the trigger
    pub(crate) trigger_waiters: AtomicU32,
}

impl Group {
    pub(crate) fn new(ix: GroupIx, stream: StreamId, slot: Slot, id: StageId) -> Self {
        Self {
            ix,
            stream,
            slot,
            id: Mutex::new(id),
            flags: Mutex::new(BitFlags::empty()),
            input: Mutex::new(GroupInput::default()),
            shots: Mutex::new(ShotBudget::default()),
            links: Mutex::new(GroupLinks::default()),
            queue: Mutex::new(None),
            size: Mutex::new((0, 0)),
            fcount: AtomicU32::new(0),
            pcount: AtomicU32::new(0),
            scount: AtomicU32::new(0),
            rcount: AtomicU32::new(0),
            sensor_fcount: AtomicU32::new(0),
            backup_fcount: AtomicU32::new(0),
            smp_shot: AtomicI32::new(0),
            trigger: Notify::new(),
            trigger_waiters: AtomicU32::new(0),
        }
    }

    /// Arena index
    #[must_use]
    pub fn ix(&self) -> GroupIx {
        self.ix
    }

    /// Owning stream
    #[must_use]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Logical role
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Current physical stage binding
    #[must_use]
    pub fn id(&self) -> StageId {
        *self.id.lock()
    }

    pub(crate) fn rebind(&self, id: StageId) {
        *self.id.lock() = id;
    }

    /// Whether `flag` is set
    #[must_use]
    pub fn has(&self, flag: GroupFlag) -> bool {
        self.flags.lock().contains(flag)
    }

    pub(crate) fn set(&self, flag: GroupFlag) {
        self.flags.lock().insert(flag);
    }

    pub(crate) fn clear(&self, flag: GroupFlag) {
        self.flags.lock().remove(flag);
    }

    /// Input mode
    #[must_use]
    pub fn input(&self) -> GroupInput {
        *self.input.lock()
    }

    pub(crate) fn set_input(&self, input: GroupInput) {
        *self.input.lock() = input;
        let mut flags = self.flags.lock();
        flags.remove(GroupFlag::OtfInput | GroupFlag::VotfInput);
        match input {
            GroupInput::Otf => flags.insert(GroupFlag::OtfInput),
            GroupInput::Votf => flags.insert(GroupFlag::VotfInput),
            GroupInput::Memory => {}
        }
    }

    /// Whether the upstream boundary is peer-to-peer (OTF or VOTF)
    #[must_use]
    pub fn peer_input(&self) -> bool {
        !matches!(self.input(), GroupInput::Memory)
    }

    /// Shot admission parameters
    #[must_use]
    pub fn shots(&self) -> ShotBudget {
        *self.shots.lock()
    }

    pub(crate) fn set_shots(&self, shots: ShotBudget) {
        *self.shots.lock() = shots;
    }

    /// Whether this group synchronizes dispatch to the sensor clock
    #[must_use]
    pub fn sensor_synced(&self) -> bool {
        self.shots().sync > 0
    }

    /// Whether the flow ledger skips this group (detector-style stages)
    #[must_use]
    pub fn flow_skip(&self) -> bool {
        self.slot == Slot::Detect
    }

    /// Snapshot of the graph links
    #[must_use]
    pub fn links(&self) -> GroupLinks {
        *self.links.lock()
    }

    pub(crate) fn update_links<F>(&self, f: F)
    where
        F: FnOnce(&mut GroupLinks),
    {
        f(&mut self.links.lock());
    }

    /// The frame queue, shared from the segment head
    #[must_use]
    pub fn queue(&self) -> Option<Arc<Mutex<FrameQueue>>> {
        self.queue.lock().clone()
    }

    pub(crate) fn set_queue(&self, queue: Option<Arc<Mutex<FrameQueue>>>) {
        *self.queue.lock() = queue;
    }

    /// Active geometry, propagated leader to junction at stream start
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        *self.size.lock()
    }

    pub(crate) fn set_size(&self, width: u32, height: u32) {
        *self.size.lock() = (width, height);
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn counters(&self) -> GroupCounters {
        GroupCounters {
            fcount: self.fcount.load(Ordering::SeqCst),
            pcount: self.pcount.load(Ordering::SeqCst),
            scount: self.scount.load(Ordering::SeqCst),
            rcount: self.rcount.load(Ordering::SeqCst),
            sensor_fcount: self.sensor_fcount.load(Ordering::SeqCst),
            backup_fcount: self.backup_fcount.load(Ordering::SeqCst),
            smp_shot: self.smp_shot.load(Ordering::SeqCst),
        }
    }

    /// Reset counters, flags, and links for a fresh open
    pub(crate) fn reset(&self) {
        *self.flags.lock() = BitFlags::empty();
        *self.input.lock() = GroupInput::default();
        *self.shots.lock() = ShotBudget::default();
        *self.links.lock() = GroupLinks::default();
        *self.size.lock() = (0, 0);
        self.fcount.store(0, Ordering::SeqCst);
        self.pcount.store(0, Ordering::SeqCst);
        self.scount.store(0, Ordering::SeqCst);
        self.rcount.store(0, Ordering::SeqCst);
        self.sensor_fcount.store(0, Ordering::SeqCst);
        self.backup_fcount.store(0, Ordering::SeqCst);
        self.smp_shot.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Group {
        Group::new(GroupIx(0), 0, Slot::Isp, StageId::new(Slot::Isp, 0))
    }

    #[test]
    fn test_flags_are_orthogonal() {
        let group = group();
        group.set(GroupFlag::Open);
        group.set(GroupFlag::Start);
        assert!(group.has(GroupFlag::Open));
        assert!(group.has(GroupFlag::Start));
        group.clear(GroupFlag::Start);
        assert!(group.has(GroupFlag::Open));
        assert!(!group.has(GroupFlag::Start));
    }

    #[test]
    fn test_input_mode_sets_flags() {
        let group = group();
        group.set_input(GroupInput::Otf);
        assert!(group.has(GroupFlag::OtfInput));
        assert!(group.peer_input());

        group.set_input(GroupInput::Votf);
        assert!(group.has(GroupFlag::VotfInput));
        assert!(!group.has(GroupFlag::OtfInput));

        group.set_input(GroupInput::Memory);
        assert!(!group.peer_input());
        assert!(!group.has(GroupFlag::VotfInput));
    }

    #[test]
    fn test_reset_clears_everything() {
        let group = group();
        group.set(GroupFlag::Start);
        group.scount.store(9, Ordering::SeqCst);
        group.update_links(|links| links.next = Some(GroupIx(3)));

        group.reset();
        assert!(!group.has(GroupFlag::Start));
        assert_eq!(group.scount.load(Ordering::SeqCst), 0);
        assert!(group.links().next.is_none());
    }

    #[test]
    fn test_budget_total() {
        let budget = ShotBudget { asyn: 1, sync: 2, skip: 0, init: 3 };
        assert_eq!(budget.total(), 3);
    }

    #[test]
    fn test_flow_skip_is_detect_only() {
        assert!(Group::new(GroupIx(0), 0, Slot::Detect, StageId::new(Slot::Detect, 0))
            .flow_skip());
        assert!(!group().flow_skip());
    }
}
