//! The group manager
//!
//! Owns every piece of scheduler state: the group arena, the per-stage
//! task table, per-stream flow ledgers and contexts, and the collaborator
//! handles. All lifecycle operations go through it and validate the
//! lifecycle phase before touching anything, so a call in the wrong phase
//! is rejected without side effects.
//!
//! The manager is an explicit instance. Creating two managers gives two
//! fully independent schedulers; nothing is shared through globals.
//!
//! # Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use visor_sched::{GroupInput, GroupManager, SchedConfig};
//! use visor_hw::{NullVotf, Slot, StageId};
//!
//! let manager = GroupManager::new(SchedConfig::default(), adapter, sensor, consumer,
//!     Arc::new(NullVotf));
//! manager.open(0, Slot::Stat, StageId::new(Slot::Stat, 0))?;
//! manager.init(0, Slot::Stat, GroupInput::Memory, true)?;
//! manager.build(0)?;
//! manager.start(0, Slot::Stat)?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use visor_frame::{FrameQueue, FrameState, QueueCounts, ShotMeta};
use visor_hw::{
    BufferConsumer, DoneStatus, HardwareAdapter, Sensor, Slot, StageId, StreamId, VotfLinker,
    MAX_CHANNELS,
};

use crate::arena::GroupArena;
use crate::config::SchedConfig;
use crate::error::{Result, SchedError};
use crate::flow::FlowLedger;
use crate::graph;
use crate::group::{Group, GroupFlag, GroupInput, GroupIx, ShotBudget};
use crate::sync::SyncCoordinator;
use crate::task::{GroupTask, TaskFlag, Work};

/// Result code stamped on frames finished by cancellation or drain
pub const RESULT_CANCELLED: u32 = 1;

/// Completion telemetry carried between frames of a stream
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Telemetry {
    pub wb_gains: [f32; 4],
    pub noise_index: u32,
}

/// Per-stream context outside any single group
#[derive(Debug, Default)]
pub(crate) struct StreamCtx {
    pub leader: Option<GroupIx>,
    pub reprocessing: bool,
    pub torch_latched: bool,
    pub telemetry: Telemetry,
}

/// The scheduler instance
///
/// Must be used from within a tokio runtime: opening a group spawns the
/// stage worker task.
pub struct GroupManager {
    pub(crate) config: SchedConfig,
    pub(crate) adapter: Arc<dyn HardwareAdapter>,
    pub(crate) sensor: Arc<dyn Sensor>,
    pub(crate) consumer: Arc<dyn BufferConsumer>,
    pub(crate) votf: Arc<dyn VotfLinker>,
    pub(crate) arena: Mutex<GroupArena>,
    tasks: Vec<Arc<GroupTask>>,
    pub(crate) ledgers: Mutex<HashMap<StreamId, FlowLedger>>,
    pub(crate) coordinator: SyncCoordinator,
    pub(crate) streams: Mutex<HashMap<StreamId, StreamCtx>>,
    weak: Weak<GroupManager>,
    quantum_timer: Mutex<Option<JoinHandle<()>>>,
}

impl GroupManager {
    /// Create a scheduler bound to its collaborators
    #[must_use]
    pub fn new(
        config: SchedConfig,
        adapter: Arc<dyn HardwareAdapter>,
        sensor: Arc<dyn Sensor>,
        consumer: Arc<dyn BufferConsumer>,
        votf: Arc<dyn VotfLinker>,
    ) -> Arc<Self> {
        let tasks = (0..StageId::COUNT)
            .map(|i| {
                let id = StageId::from_index(i);
                Arc::new(GroupTask::new(id, config.priority_for(id.slot())))
            })
            .collect();
        let quantum = config.quantum;
        Arc::new_cyclic(|weak| Self {
            config,
            adapter,
            sensor,
            consumer,
            votf,
            arena: Mutex::new(GroupArena::new()),
            tasks,
            ledgers: Mutex::new(HashMap::new()),
            coordinator: SyncCoordinator::new(quantum),
            streams: Mutex::new(HashMap::new()),
            weak: weak.clone(),
            quantum_timer: Mutex::new(None),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Task for a physical stage
    pub(crate) fn task(&self, stage: StageId) -> Arc<GroupTask> {
        Arc::clone(&self.tasks[stage.index()])
    }

    /// Open group for a key, if any
    #[must_use]
    pub fn group(&self, stream: StreamId, slot: Slot) -> Option<Arc<Group>> {
        self.arena.lock().get(stream, slot)
    }

    pub(crate) fn by_ix(&self, ix: GroupIx) -> Option<Arc<Group>> {
        self.arena.lock().by_ix(ix)
    }

    fn group_of(&self, stream: StreamId, slot: Slot) -> Result<Arc<Group>> {
        self.group(stream, slot)
            .ok_or_else(|| SchedError::state(stream, slot, "group is not open"))
    }

    /// Head group and every peer-input member of its segment, in order
    pub(crate) fn segment_members(&self, head: &Arc<Group>) -> Vec<Arc<Group>> {
        let mut members = vec![Arc::clone(head)];
        let mut cursor = head.links().child;
        while let Some(ix) = cursor {
            let Some(member) = self.by_ix(ix) else { break };
            cursor = member.links().child;
            members.push(member);
        }
        members
    }

    pub(crate) fn with_ctx<R>(&self, stream: StreamId, f: impl FnOnce(&mut StreamCtx) -> R) -> R {
        f(self.streams.lock().entry(stream).or_default())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open a group: bind its stage task and allocate its frame queue
    pub fn open(&self, stream: StreamId, slot: Slot, id: StageId) -> Result<()> {
        let group = {
            let mut arena = self.arena.lock();
            arena
                .insert(stream, slot, id)
                .ok_or_else(|| SchedError::state(stream, slot, "group is already open"))?
        };
        self.bind_group(&group, id);
        self.with_ctx(stream, |_| {});
        info!(stream, slot = %slot, stage = %id, "group opened");
        Ok(())
    }

    /// Open a duplicated parallel twin for an already-open slot
    pub fn open_parallel(&self, stream: StreamId, slot: Slot, id: StageId) -> Result<()> {
        let group = {
            let mut arena = self.arena.lock();
            arena.insert_parallel(stream, slot, id).ok_or_else(|| {
                SchedError::state(stream, slot, "parallel twin needs an open main group")
            })?
        };
        self.bind_group(&group, id);
        info!(stream, slot = %slot, stage = %id, "parallel twin opened");
        Ok(())
    }

    fn bind_group(&self, group: &Arc<Group>, id: StageId) {
        group.reset();
        group.set(GroupFlag::Open);
        group.set_queue(Some(Arc::new(Mutex::new(FrameQueue::new(
            id.index() as u32,
            self.config.queue_capacity,
        )))));
        let task = self.task(id);
        if task.acquire() == 1 {
            self.spawn_worker(id);
        }
    }

    /// Close a group: release its task and remove it from the arena
    pub fn close(&self, stream: StreamId, slot: Slot) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if group.has(GroupFlag::Start) {
            return Err(SchedError::state(stream, slot, "group is still started"));
        }

        if group.has(GroupFlag::VotfConnLink) {
            if let Err(err) = self.votf.destroy_link(group.id()) {
                warn!(stream, slot = %slot, error = %err, "forced link teardown failed");
            }
            group.clear(GroupFlag::VotfConnLink);
        }

        self.release_task(group.id());
        if let Some(twin) = self.arena.lock().remove_parallel(stream, slot) {
            self.release_task(twin.id());
            twin.set_queue(None);
        }
        self.arena.lock().remove(stream, slot);
        group.clear(GroupFlag::Open);
        group.set_queue(None);

        let stream_empty = {
            let arena = self.arena.lock();
            arena.stream_groups(stream).is_empty() && arena.stream_parallel(stream).is_empty()
        };
        if stream_empty {
            self.streams.lock().remove(&stream);
            self.ledgers.lock().remove(&stream);
        }
        info!(stream, slot = %slot, "group closed");
        Ok(())
    }

    fn release_task(&self, id: StageId) {
        let task = self.task(id);
        if task.release() == 0 {
            task.request_stop();
        }
    }

    /// Configure a group's input mode and leader role
    pub fn init(
        &self,
        stream: StreamId,
        slot: Slot,
        input: GroupInput,
        leader: bool,
    ) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if !group.has(GroupFlag::Open) {
            return Err(SchedError::state(stream, slot, "group is not open"));
        }
        if group.has(GroupFlag::Start) {
            return Err(SchedError::state(stream, slot, "group is already started"));
        }

        group.set_input(input);
        group.set(GroupFlag::Init);
        if leader {
            self.with_ctx(stream, |ctx| ctx.leader = Some(group.ix()));
            self.ledgers
                .lock()
                .entry(stream)
                .or_insert_with(|| FlowLedger::new(stream, self.config.queue_capacity));
        }
        debug!(stream, slot = %slot, ?input, leader, "group initialized");
        Ok(())
    }

    /// Mark a stream as reprocessing (capture) rather than preview
    pub fn configure_stream(&self, stream: StreamId, reprocessing: bool) {
        self.with_ctx(stream, |ctx| ctx.reprocessing = reprocessing);
    }

    /// Rebuild the stream's pipeline graph from its open groups
    pub fn build(&self, stream: StreamId) -> Result<()> {
        let leader = self
            .streams
            .lock()
            .get(&stream)
            .and_then(|ctx| ctx.leader)
            .ok_or_else(|| SchedError::state(stream, Slot::Sensor, "stream has no leader"))?;
        graph::build_stream(&self.arena.lock(), stream, leader)
    }

    /// Start a group: budget admission, seed the sensor counter, enable
    /// the worker
    pub fn start(&self, stream: StreamId, slot: Slot) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if !group.has(GroupFlag::Init) {
            return Err(SchedError::state(stream, slot, "group is not initialized"));
        }
        if group.has(GroupFlag::Start) {
            return Err(SchedError::state(stream, slot, "group is already started"));
        }

        let links = group.links();
        let is_head = links.head == Some(group.ix());
        let synced_head =
            is_head && (slot.is_sensor_facing() || group.input() == GroupInput::Otf);
        let budget = if synced_head {
            ShotBudget {
                asyn: self.config.asyn_shots,
                sync: self.config.sync_shots,
                skip: self.config.skip_shots,
                init: self.config.asyn_shots + self.config.sync_shots,
            }
        } else {
            let asyn = self.config.asyn_shots.max(1);
            ShotBudget { asyn, sync: 0, skip: self.config.skip_shots, init: asyn }
        };
        group.set_shots(budget);
        group
            .smp_shot
            .store(budget.total() as i32, Ordering::SeqCst);

        let task = self.task(group.id());
        task.set_budget(budget.total().max(1));
        task.clear(TaskFlag::RequestStop);

        if synced_head {
            let seed = if self.sensor.is_streaming() {
                self.sensor.current_fcount() + 1
            } else {
                1
            };
            group
                .sensor_fcount
                .store(seed, Ordering::SeqCst);
            group
                .backup_fcount
                .store(0, Ordering::SeqCst);
        }

        if group.has(GroupFlag::VotfInput) {
            let (width, height) = (self.sensor.width(), self.sensor.height());
            if let Err(err) = self.votf.create_link(group.id(), width, height) {
                group.clear(GroupFlag::VotfConnLink);
                return Err(err.into());
            }
            group.set(GroupFlag::VotfConnLink);
        }

        if let Err(err) = self.adapter.process_start(group.id()) {
            // A link latched above must not outlive the failed start.
            if group.has(GroupFlag::VotfConnLink) {
                if let Err(unlink_err) = self.votf.destroy_link(group.id()) {
                    warn!(stream, slot = %slot, error = %unlink_err, "link reset failed");
                }
                group.clear(GroupFlag::VotfConnLink);
            }
            return Err(err.into());
        }
        group.set(GroupFlag::Start);
        self.spawn_worker(group.id());
        self.ensure_quantum_timer();
        info!(stream, slot = %slot, budget = budget.total(), sync = budget.sync, "group started");
        Ok(())
    }

    /// Validate the whole chain and turn the stream on
    ///
    /// Every memory-input group must already be started; the leader's
    /// geometry is propagated to every group that has none of its own.
    pub fn start_stream(&self, stream: StreamId) -> Result<()> {
        let groups = self.arena.lock().stream_groups(stream);
        if groups.is_empty() {
            return Err(SchedError::state(stream, Slot::Sensor, "stream has no open groups"));
        }
        for group in &groups {
            if !group.peer_input() && !group.has(GroupFlag::Start) {
                return Err(SchedError::state(
                    stream,
                    group.slot(),
                    "memory-input group not started before stream start",
                ));
            }
        }

        let (width, height) = (self.sensor.width(), self.sensor.height());
        groups[0].set_size(width, height);
        for group in &groups[1..] {
            if group.size() == (0, 0) {
                group.set_size(width, height);
            }
        }

        self.adapter.stream_on(stream)?;
        info!(stream, groups = groups.len(), "stream started");
        Ok(())
    }

    /// Turn the stream off after its leader has stopped
    pub fn stop_stream(&self, stream: StreamId) -> Result<()> {
        let leader = self
            .streams
            .lock()
            .get(&stream)
            .and_then(|ctx| ctx.leader)
            .and_then(|ix| self.arena.lock().by_ix(ix));
        if let Some(leader) = leader {
            if leader.has(GroupFlag::Start) {
                return Err(SchedError::state(
                    stream,
                    leader.slot(),
                    "leader still started at stream stop",
                ));
            }
        }
        self.adapter.stream_off(stream)?;
        info!(stream, "stream stopped");
        Ok(())
    }

    /// Ask the coming stop to skip graceful quiescing
    pub fn request_force_stop(&self, stream: StreamId, slot: Slot) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        group.set(GroupFlag::RequestForceStop);
        Ok(())
    }

    // =========================================================================
    // FRAME PATH
    // =========================================================================

    /// Admit a frame for dispatch
    ///
    /// The frame must be FREE. The consumer's control block is stamped
    /// onto it, the sensor-request look-back override applied, and the
    /// work handed to the stage worker (or parked by the coordinator for
    /// shared-stage reprocessing).
    pub fn buffer_queue(
        &self,
        stream: StreamId,
        slot: Slot,
        index: u32,
        meta: ShotMeta,
    ) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if !group.has(GroupFlag::Start) {
            return Err(SchedError::state(stream, slot, "group is not started"));
        }
        let queue = group
            .queue()
            .ok_or_else(|| SchedError::state(stream, slot, "group has no queue"))?;
        let head = group
            .links()
            .head
            .and_then(|ix| self.by_ix(ix))
            .unwrap_or_else(|| Arc::clone(&group));

        {
            let mut q = queue.lock();
            let frame = q.frame_mut(index)?;
            if frame.state() != FrameState::Free {
                return Err(SchedError::state(
                    stream,
                    slot,
                    format!("frame {index} queued while {:?}", frame.state()),
                ));
            }
            if frame.out_flag != 0 {
                warn!(stream, slot = %slot, index, out_flag = frame.out_flag,
                    "stale output flags on queued frame, clearing");
                frame.out_flag = 0;
                frame.bak_flag = 0;
            }
            frame.result = 0;
            frame.stripe = visor_frame::StripeInfo::default();
            frame.repeat = None;
            frame.meta = meta.clone();

            // Manual-exposure changes must reach the sensor inside its
            // latency window; copy them back onto frames already queued.
            if meta.ae_mode == visor_frame::AeMode::Off {
                q.for_each_request_tail(self.config.lookback_depth, |pending| {
                    pending.meta.exposure_time_ns = meta.exposure_time_ns;
                    pending.meta.frame_duration_ns = meta.frame_duration_ns;
                    pending.meta.sensitivity = meta.sensitivity;
                    pending.meta.iso_value = meta.iso_value;
                });
            }

            q.transition(index, FrameState::Request)?;
            let rcount = head.rcount.fetch_add(1, Ordering::SeqCst) + 1;
            q.frame_mut(index)?.rcount = rcount;
        }

        let work = Work { group: group.ix(), index, redispatch: false };
        let task = self.task(group.id());
        let reprocessing = self.with_ctx(stream, |ctx| ctx.reprocessing);
        if self
            .coordinator
            .should_park(task.refcount(), reprocessing, group.peer_input())
        {
            self.coordinator.park(group.id(), stream, work);
        } else {
            task.push(work);
            if !reprocessing {
                for parked in self.coordinator.drain_stage(group.id()) {
                    task.push(parked.work);
                }
            }
        }
        Ok(())
    }

    /// Return a COMPLETE frame to the consumer
    pub fn buffer_finish(&self, stream: StreamId, slot: Slot, index: u32) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        let queue = group
            .queue()
            .ok_or_else(|| SchedError::state(stream, slot, "group has no queue"))?;
        let mut q = queue.lock();
        let state = q.frame(index)?.state();
        if state != FrameState::Complete {
            return Err(SchedError::state(
                stream,
                slot,
                format!("frame {index} finished while {state:?}"),
            ));
        }
        q.transition(index, FrameState::Free)?;
        Ok(())
    }

    /// Record a hardware completion for a dispatched frame
    pub fn done(&self, stream: StreamId, slot: Slot, index: u32, status: DoneStatus) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        let queue = group
            .queue()
            .ok_or_else(|| SchedError::state(stream, slot, "group has no queue"))?;
        let links = group.links();
        let head = links
            .head
            .and_then(|ix| self.by_ix(ix))
            .unwrap_or_else(|| Arc::clone(&group));

        let (fcount, meta, redispatch) = {
            let mut q = queue.lock();
            let frame = q.frame_mut(index)?;
            if frame.state() != FrameState::Process {
                warn!(stream, slot = %slot, index, state = ?frame.state(),
                    "late completion for a frame no longer in flight");
                return Ok(());
            }
            if let DoneStatus::Error(code) = status {
                frame.result = code;
            }
            // The completion closes the whole transaction; every
            // sub-entry latched at dispatch has delivered.
            frame.out_flag = 0;

            // Another stripe or repeat pass owed: the frame stays in
            // PROCESS and goes straight back to the worker.
            let redispatch = if frame.stripe.has_remaining() {
                frame.stripe.region_id += 1;
                true
            } else if let Some(repeat) = frame.repeat.as_mut() {
                if repeat.remaining > 0 {
                    repeat.remaining -= 1;
                    true
                } else {
                    false
                }
            } else {
                false
            };
            (frame.fcount, frame.meta.clone(), redispatch)
        };

        let reprocessing = self.with_ctx(stream, |ctx| ctx.reprocessing);
        if reprocessing && status.is_error() {
            error!(stream, slot = %slot, index, fcount, "reprocessing frame completed with error");
        }

        // Settle frames carry meaningless telemetry; only completions past
        // the skip window feed the carried values.
        if fcount > group.shots().skip {
            self.with_ctx(stream, |ctx| {
                ctx.telemetry.wb_gains = meta.wb_gains;
                ctx.telemetry.noise_index = meta.noise_index_next;
            });
        }

        if status.is_error() {
            if let Some(gnext) = links.gnext {
                let mut ledgers = self.ledgers.lock();
                if let Some(ledger) = ledgers.get_mut(&stream) {
                    ledger.recall(gnext, fcount);
                }
            }
        }

        // Return what the shot acquired: child stage permits for a
        // buffered head, the shot counter, and the own admission permit.
        if group.ix() == head.ix() && !group.peer_input() {
            for member in self.segment_members(&head).iter().skip(1) {
                let member_task = self.task(member.id());
                if member_task.has(TaskFlag::Start) {
                    member_task.release_permit();
                }
            }
        }
        group.smp_shot.fetch_add(1, Ordering::SeqCst);
        self.task(group.id()).release_permit();

        if redispatch {
            self.task(group.id())
                .push(Work { group: group.ix(), index, redispatch: true });
            return Ok(());
        }

        let prev = head.rcount.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            warn!(stream, slot = %slot, "request count underflow at completion");
            head.rcount.store(0, Ordering::SeqCst);
        }

        if let DoneStatus::Error(code) = status {
            self.consumer.shot_done(stream, group.id(), fcount, code);
        }

        queue.lock().transition(index, FrameState::Complete)?;
        self.consumer.done(stream, group.id(), index, status);
        Ok(())
    }

    /// Sensor frame boundary: advance the head counter and fire triggers
    pub fn sensor_tick(&self, stream: StreamId, fcount: u32) {
        let leader = self
            .streams
            .lock()
            .get(&stream)
            .and_then(|ctx| ctx.leader)
            .and_then(|ix| self.arena.lock().by_ix(ix));
        let Some(leader) = leader else { return };
        if !leader.sensor_synced() {
            return;
        }
        let next = fcount + 1;
        let current = leader
            .sensor_fcount
            .load(Ordering::SeqCst);
        if next > current {
            leader
                .sensor_fcount
                .store(next, Ordering::SeqCst);
        }
        leader.trigger.notify_one();
    }

    /// Rebind a sensor-facing chain onto another physical channel
    ///
    /// Only a sensor-slot, OTF-output group may move. The group and its
    /// peer-input members migrate together; their old tasks are released
    /// and the new channel's tasks bound.
    pub fn change_chain(&self, stream: StreamId, slot: Slot, next_channel: u32) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if !slot.is_sensor_facing() || !group.has(GroupFlag::OtfOutput) {
            return Err(SchedError::state(
                stream,
                slot,
                "chain change needs a sensor-slot, OTF-output group",
            ));
        }
        if next_channel >= MAX_CHANNELS {
            return Err(SchedError::state(
                stream,
                slot,
                format!("channel {next_channel} out of range"),
            ));
        }

        group.set(GroupFlag::Standby);
        let members = self.segment_members(&group);
        for member in &members {
            let old = member.id();
            let new = old.with_channel(next_channel);
            if old == new {
                continue;
            }
            self.release_task(old);
            let new_task = self.task(new);
            if new_task.acquire() == 1 {
                self.spawn_worker(new);
            }
            new_task.set_budget(member.shots().total().max(1));
            member.rebind(new);
            debug!(stream, slot = %member.slot(), from = %old, to = %new, "stage rebound");
        }
        group.clear(GroupFlag::Standby);
        info!(stream, slot = %slot, next_channel, "chain changed");
        Ok(())
    }

    // =========================================================================
    // STOP / DRAIN
    // =========================================================================

    /// Stop a segment head, draining everything it owns
    ///
    /// Runs the full drain protocol. The group always ends stopped and
    /// clean; if any phase needed forcing the aggregate count comes back
    /// as [`SchedError::DrainTimeout`].
    pub async fn stop(&self, stream: StreamId, slot: Slot) -> Result<()> {
        let group = self.group_of(stream, slot)?;
        if !group.has(GroupFlag::Start) {
            return Err(SchedError::state(stream, slot, "group is already stopped"));
        }
        if group.links().head != Some(group.ix()) {
            return Err(SchedError::state(stream, slot, "stop must target a segment head"));
        }
        let queue = group
            .queue()
            .ok_or_else(|| SchedError::state(stream, slot, "group has no queue"))?;
        let task = self.task(group.id());
        let mut errors = 0u32;

        // Phase 1: drain REQUEST by letting shots run, escalating to a
        // forced trigger when the sensor cannot provide one.
        let mut retry = self.config.drain_retry;
        loop {
            if queue.lock().queued_count(FrameState::Request) == 0 {
                break;
            }
            if retry == 0 {
                warn!(stream, slot = %slot, "requests did not drain");
                errors += 1;
                break;
            }
            let escalated = retry < self.config.drain_escalation;
            if group.sensor_synced()
                && group
                    .trigger_waiters
                    .load(Ordering::SeqCst)
                    > 0
            {
                let sensor_gone = !self.sensor.is_open()
                    || !self.sensor.is_streaming()
                    || !self.sensor.is_back_started();
                if sensor_gone || escalated {
                    group.set(GroupFlag::ForceStop);
                    group.trigger.notify_one();
                }
            }
            if !group.peer_input() {
                for (stage, parked) in self.coordinator.drain_stream(stream) {
                    self.task(stage).push(parked.work);
                }
            }
            if escalated {
                group.set(GroupFlag::ForceStop);
                task.stop.notify_waiters();
            }
            tokio::time::sleep(self.config.drain_sleep).await;
            retry -= 1;
        }

        // Phase 2: wait out the in-progress shot.
        let mut retry = self.config.drain_retry;
        while group.has(GroupFlag::Shot) {
            if retry == 0 {
                warn!(stream, slot = %slot, "shot flag stuck, forcing clear");
                group.clear(GroupFlag::Shot);
                errors += 1;
                break;
            }
            tokio::time::sleep(self.config.drain_sleep).await;
            retry -= 1;
        }

        // Phase 3: stop processing on every member, main and parallel.
        let force =
            group.has(GroupFlag::ForceStop) || group.has(GroupFlag::RequestForceStop);
        let mut members = self.segment_members(&group);
        if let Some(pnext) = group.links().pnext {
            if let Some(twin) = self.by_ix(pnext) {
                members.extend(self.segment_members(&twin));
            }
        }
        for member in &members {
            if let Err(err) = self.adapter.process_stop(member.id(), force) {
                warn!(stream, stage = %member.id(), error = %err, "process stop failed");
                errors += 1;
            }
        }

        // Phase 4: tear down any latched point-to-point links.
        for member in &members {
            if member.has(GroupFlag::VotfConnLink) {
                if let Err(err) = self.votf.destroy_link(member.id()) {
                    warn!(stream, stage = %member.id(), error = %err, "link teardown failed");
                    errors += 1;
                }
                member.clear(GroupFlag::VotfConnLink);
            }
        }

        // Phase 5: wait for in-flight frames to complete.
        let mut retry = self.config.drain_retry;
        while queue.lock().queued_count(FrameState::Process) > 0 {
            if retry == 0 {
                warn!(stream, slot = %slot, "in-flight frames did not drain");
                errors += 1;
                break;
            }
            tokio::time::sleep(self.config.drain_sleep).await;
            retry -= 1;
        }

        // Phase 6: anything still requested is completed by force. The
        // one place the worker's pending queue may be flushed.
        let mut retry = self.config.drain_retry;
        while queue.lock().queued_count(FrameState::Request) > 0 && retry > 0 {
            tokio::time::sleep(self.config.drain_sleep).await;
            retry -= 1;
        }
        let leftovers = queue.lock().indices(FrameState::Request);
        if !leftovers.is_empty() {
            warn!(stream, slot = %slot, count = leftovers.len(), "force completing requests");
            errors += leftovers.len() as u32;
            let flushed = task.flush(group.ix());
            if flushed > 0 {
                debug!(stream, slot = %slot, flushed, "flushed pending work");
            }
            for index in leftovers {
                {
                    let mut q = queue.lock();
                    let frame = q.frame_mut(index)?;
                    frame.result = RESULT_CANCELLED;
                    frame.out_flag = 0;
                    q.force_complete(index)?;
                }
                self.consumer
                    .done(stream, group.id(), index, DoneStatus::Error(RESULT_CANCELLED));
            }
        }

        // Phase 7: settle the books.
        let residual = group.rcount.swap(0, Ordering::SeqCst);
        if residual > 0 {
            error!(stream, slot = %slot, residual, "requests outstanding after drain");
            errors += 1;
        }
        if let Some(ledger) = self.ledgers.lock().get_mut(&stream) {
            ledger.flush();
        }
        for member in &members {
            member.clear(GroupFlag::ForceStop);
            member.clear(GroupFlag::RequestForceStop);
            member.clear(GroupFlag::Start);
        }
        queue.lock().check_consistency()?;

        if errors > 0 {
            Err(SchedError::DrainTimeout { stream, slot, errors })
        } else {
            info!(stream, slot = %slot, "group stopped clean");
            Ok(())
        }
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// Bucket counts of a group's queue
    pub fn queue_counts(&self, stream: StreamId, slot: Slot) -> Result<QueueCounts> {
        let group = self.group_of(stream, slot)?;
        let queue = group
            .queue()
            .ok_or_else(|| SchedError::state(stream, slot, "group has no queue"))?;
        let counts = queue.lock().counts();
        Ok(counts)
    }

    /// Available and budgeted admission permits of a group's stage
    pub fn admission(&self, stream: StreamId, slot: Slot) -> Result<(u32, u32)> {
        let group = self.group_of(stream, slot)?;
        let task = self.task(group.id());
        Ok((task.available(), task.budget()))
    }

    /// Outstanding consumer requests on a group
    pub fn outstanding_requests(&self, stream: StreamId, slot: Slot) -> Result<u32> {
        let group = self.group_of(stream, slot)?;
        Ok(group.rcount.load(Ordering::SeqCst))
    }

    // =========================================================================
    // WORKERS
    // =========================================================================

    fn spawn_worker(&self, stage: StageId) {
        let task = self.task(stage);
        let mut guard = task.worker.lock();
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            task.set(TaskFlag::Start);
            task.clear(TaskFlag::RequestStop);
            return;
        }

        let weak = self.weak.clone();
        let worker_task = Arc::clone(&task);
        *guard = Some(tokio::spawn(async move {
            debug!(stage = %worker_task.id(), "worker running");
            loop {
                let work = loop {
                    if let Some(work) = worker_task.pop() {
                        break Some(work);
                    }
                    if worker_task.has(TaskFlag::RequestStop) && worker_task.refcount() == 0 {
                        break None;
                    }
                    worker_task.kick.notified().await;
                };
                let Some(work) = work else { break };
                let Some(manager) = weak.upgrade() else { break };
                if let Err(err) = manager.execute_shot(work).await {
                    warn!(stage = %worker_task.id(), error = %err, "shot failed");
                }
            }
            worker_task.clear(TaskFlag::Start);
            debug!(stage = %worker_task.id(), "worker exited");
        }));
        task.set(TaskFlag::Start);
        task.clear(TaskFlag::RequestStop);
    }

    fn ensure_quantum_timer(&self) {
        let mut guard = self.quantum_timer.lock();
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = self.weak.clone();
        let period = (self.config.quantum / 4).max(Duration::from_millis(1));
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                for (stage, parked) in manager.coordinator.take_expired() {
                    debug!(stage = %stage, stream = parked.stream, "quantum expired, dispatching");
                    manager.task(stage).push(parked.work);
                }
            }
        }));
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            if let Some(handle) = task.worker.lock().take() {
                handle.abort();
            }
        }
        if let Some(handle) = self.quantum_timer.lock().take() {
            handle.abort();
        }
    }
}
