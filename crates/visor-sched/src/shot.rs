//! Shot execution and cancellation
//!
//! One shot claims, in order: the available-shot counter, the stage's
//! admission permit, the admission permits of every started peer-input
//! member (for a buffered head), and a sensor-synchronized frame count.
//! Dispatch forgets the permits; the completion path returns them. Any
//! failure between the first claim and dispatch rolls back exactly what
//! was acquired and cancels the frame.
//!
//! Cancellation never yanks a frame out from under converging output: a
//! bounded settle loop waits for the queue tails to stop owing output
//! before the frame is completed with error status.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};
use visor_frame::{FlashMode, FrameQueue, FrameState, ShotMeta};
use visor_hw::{DoneStatus, ShotRequest};

use crate::error::{Result, SchedError};
use crate::group::{Group, GroupFlag};
use crate::manager::{GroupManager, RESULT_CANCELLED};
use crate::task::{GroupTask, TaskFlag, Work};

/// Resources held by a shot before dispatch commits them
#[derive(Default)]
struct Rollback {
    own: Option<OwnedSemaphorePermit>,
    children: Vec<OwnedSemaphorePermit>,
    smp_taken: bool,
}

impl Rollback {
    /// Dispatch succeeded: permits stay claimed until the completion
    fn commit(mut self) {
        if let Some(permit) = self.own.take() {
            permit.forget();
        }
        for permit in self.children.drain(..) {
            permit.forget();
        }
    }

    /// Dispatch failed: drop the permits back and restore the counter
    fn undo(mut self, group: &Group) {
        self.own.take();
        self.children.clear();
        if self.smp_taken {
            group.smp_shot.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl GroupManager {
    /// Run one unit of dispatch work on the stage worker
    pub(crate) async fn execute_shot(&self, work: Work) -> Result<()> {
        let Some(group) = self.by_ix(work.group) else {
            // Closed while the work was queued.
            return Ok(());
        };
        let Some(queue) = group.queue() else {
            return Ok(());
        };
        let links = group.links();
        let head = links
            .head
            .and_then(|ix| self.by_ix(ix))
            .unwrap_or_else(|| Arc::clone(&group));
        let task = self.task(group.id());
        let stream = group.stream();

        group.set(GroupFlag::Shot);
        group.pcount.fetch_add(1, Ordering::SeqCst);

        if head.has(GroupFlag::Standby) || group.has(GroupFlag::ForceStop) {
            debug!(stream, slot = %group.slot(), index = work.index, "cancelling on stopped group");
            if let Err(err) = self.cancel_frame(&group, &queue, work.index).await {
                warn!(stream, slot = %group.slot(), error = %err, "cancel failed");
            }
            group.clear(GroupFlag::Shot);
            return Ok(());
        }
        if task.has(TaskFlag::RequestStop) {
            // Stop raced the kick; the frame stays requested for drain.
            group.clear(GroupFlag::Shot);
            return Ok(());
        }

        let mut rollback = Rollback::default();
        group.smp_shot.fetch_sub(1, Ordering::SeqCst);
        rollback.smp_taken = true;

        // A stop wake on a shared stage may belong to another stream's
        // drain; only a stop aimed at this chain cancels the wait.
        let own = loop {
            tokio::select! {
                permit = task.resource().acquire_owned() => break permit.ok(),
                _ = task.stop.notified() => {
                    if group.has(GroupFlag::ForceStop) || task.has(TaskFlag::RequestStop) {
                        break None;
                    }
                }
            }
        };
        let Some(own) = own else {
            let err = SchedError::AdmissionInterrupted { stage: task.id() };
            return self.abort_shot(rollback, &group, &queue, work.index, err).await;
        };
        rollback.own = Some(own);

        if group.has(GroupFlag::ForceStop) || task.has(TaskFlag::RequestStop) {
            let err = SchedError::AdmissionInterrupted { stage: task.id() };
            return self.abort_shot(rollback, &group, &queue, work.index, err).await;
        }

        // A buffered head claims its whole segment's capacity before the
        // transaction starts; peer-input members never dispatch alone.
        if group.ix() == head.ix() && !group.peer_input() {
            for member in self.segment_members(&group).iter().skip(1) {
                let member_task = self.task(member.id());
                if !member_task.has(TaskFlag::Start) {
                    continue;
                }
                let permit = loop {
                    tokio::select! {
                        permit = member_task.resource().acquire_owned() => break permit.ok(),
                        _ = task.stop.notified() => {
                            if group.has(GroupFlag::ForceStop)
                                || task.has(TaskFlag::RequestStop)
                                || member_task.has(TaskFlag::RequestStop)
                            {
                                break None;
                            }
                        }
                    }
                };
                let Some(permit) = permit else {
                    let err = SchedError::AdmissionInterrupted { stage: member_task.id() };
                    return self.abort_shot(rollback, &group, &queue, work.index, err).await;
                };
                rollback.children.push(permit);
            }
        }

        let fcount = if work.redispatch {
            let current = { queue.lock().frame(work.index).map(|frame| frame.fcount) };
            match current {
                Ok(fcount) => fcount,
                Err(err) => {
                    return self
                        .abort_shot(rollback, &group, &queue, work.index, err.into())
                        .await
                }
            }
        } else {
            match self.settle_fcount(&group, &task).await {
                Ok(fcount) => fcount,
                Err(err) => {
                    return self.abort_shot(rollback, &group, &queue, work.index, err).await
                }
            }
        };
        // A synchronized stage never sees its sequence regress.
        let fcount = fcount.max(group.fcount.load(Ordering::SeqCst));
        group.fcount.store(fcount, Ordering::SeqCst);

        let members = self.segment_members(&head);
        let (torch, noise_index) =
            self.with_ctx(stream, |ctx| (ctx.torch_latched, ctx.telemetry.noise_index));
        let meta = match stamp_frame(&queue, &members, &work, fcount, noise_index, torch) {
            Ok((meta, latched)) => {
                if latched {
                    self.with_ctx(stream, |ctx| ctx.torch_latched = true);
                }
                meta
            }
            Err(err) => return self.abort_shot(rollback, &group, &queue, work.index, err).await,
        };

        let tracked = group.ix() == head.ix()
            && !group.flow_skip()
            && (links.gprev.is_some() || links.gnext.is_some());
        if tracked && !work.redispatch {
            let checked = {
                let mut ledgers = self.ledgers.lock();
                match ledgers.get_mut(&stream) {
                    Some(ledger) if links.gprev.is_none() => {
                        ledger.check_pre_leader(head.ix(), group.slot(), fcount)
                    }
                    Some(ledger) => ledger.check_pre_member(head.ix(), fcount),
                    None => Ok(()),
                }
            };
            if let Err(err) = checked {
                return self.abort_shot(rollback, &group, &queue, work.index, err).await;
            }
        }

        let request = ShotRequest {
            stream,
            stage: group.id(),
            index: work.index,
            fcount,
            meta,
        };
        if let Err(err) = self.adapter.shot(&request) {
            return self
                .abort_shot(rollback, &group, &queue, work.index, err.into())
                .await;
        }

        if tracked && !work.redispatch {
            let requested = links
                .gnext
                .and_then(|ix| self.by_ix(ix))
                .is_some_and(|next| next.rcount.load(Ordering::SeqCst) > 0);
            let mut ledgers = self.ledgers.lock();
            if let Some(ledger) = ledgers.get_mut(&stream) {
                ledger.check_post(head.ix(), links.gnext, fcount, requested);
            }
        }

        group.scount.fetch_add(1, Ordering::SeqCst);
        rollback.commit();
        group.clear(GroupFlag::Shot);
        debug!(stream, slot = %group.slot(), index = work.index, fcount, "shot dispatched");
        Ok(())
    }

    /// Pick the frame count for this dispatch, waiting on the sensor when
    /// the deviation heuristic says the stage must not run ahead
    async fn settle_fcount(&self, group: &Arc<Group>, task: &Arc<GroupTask>) -> Result<u32> {
        let shots = group.shots();
        if group.sensor_synced() {
            // Bootstrap: the sensor front end is not producing yet; the
            // first init shots advance the counter themselves.
            if !self.sensor.is_streaming() && shots.init > group.scount.load(Ordering::SeqCst) {
                let snapshot = group.sensor_fcount.load(Ordering::SeqCst);
                group.backup_fcount.store(snapshot, Ordering::SeqCst);
                group.sensor_fcount.store(snapshot + 1, Ordering::SeqCst);
                return Ok(snapshot);
            }

            let must_wait = shots.asyn == 0
                || group.smp_shot.load(Ordering::SeqCst) < self.config.min_sync_shots as i32
                || group.backup_fcount.load(Ordering::SeqCst)
                    >= group.sensor_fcount.load(Ordering::SeqCst);
            if must_wait {
                group.trigger_waiters.fetch_add(1, Ordering::SeqCst);
                let interrupted = loop {
                    tokio::select! {
                        _ = group.trigger.notified() => break false,
                        _ = task.stop.notified() => {
                            // Ignore stop wakes raised by another stream
                            // draining the shared stage.
                            if group.has(GroupFlag::ForceStop) || task.has(TaskFlag::RequestStop) {
                                break true;
                            }
                        }
                    }
                };
                group.trigger_waiters.fetch_sub(1, Ordering::SeqCst);
                if interrupted
                    || group.has(GroupFlag::ForceStop)
                    || task.has(TaskFlag::RequestStop)
                {
                    return Err(SchedError::AdmissionInterrupted { stage: task.id() });
                }
                let snapshot = group.sensor_fcount.load(Ordering::SeqCst);
                group.backup_fcount.store(snapshot, Ordering::SeqCst);
                Ok(snapshot)
            } else {
                // Slack remains: dispatch against the current count and
                // speculatively advance it, at most one frame of lookahead.
                let snapshot = group.sensor_fcount.load(Ordering::SeqCst);
                group.backup_fcount.store(snapshot, Ordering::SeqCst);
                group.sensor_fcount.fetch_add(1, Ordering::SeqCst);
                Ok(snapshot)
            }
        } else if group.peer_input() {
            let synced = group.sensor_fcount.load(Ordering::SeqCst);
            Ok(synced.max(group.fcount.load(Ordering::SeqCst) + 1))
        } else {
            Ok(group.fcount.load(Ordering::SeqCst) + 1)
        }
    }

    async fn abort_shot(
        &self,
        rollback: Rollback,
        group: &Arc<Group>,
        queue: &Arc<Mutex<FrameQueue>>,
        index: u32,
        err: SchedError,
    ) -> Result<()> {
        warn!(stream = group.stream(), slot = %group.slot(), index, error = %err, "shot aborted");
        rollback.undo(group);
        if let Err(cancel_err) = self.cancel_frame(group, queue, index).await {
            warn!(stream = group.stream(), slot = %group.slot(), error = %cancel_err,
                "cancel after abort failed");
        }
        group.clear(GroupFlag::Shot);
        Err(err)
    }

    /// Finish a frame with error status without dispatching it
    pub(crate) async fn cancel_frame(
        &self,
        group: &Arc<Group>,
        queue: &Arc<Mutex<FrameQueue>>,
        index: u32,
    ) -> Result<()> {
        // Settle: give converging output a bounded chance to land before
        // the frame is finished out from under it.
        let mut retry = self.config.cancel_retry;
        loop {
            let unsettled = {
                let q = queue.lock();
                let free_owes =
                    q.peek_tail(FrameState::Free).is_some_and(|f| f.out_flag != 0);
                let complete_owes =
                    q.peek_tail(FrameState::Complete).is_some_and(|f| f.out_flag != 0);
                let process_moving =
                    q.peek(FrameState::Process).is_some_and(|f| f.bak_flag != f.out_flag);
                free_owes || complete_owes || process_moving
            };
            if !unsettled {
                break;
            }
            if retry == 0 {
                warn!(stream = group.stream(), slot = %group.slot(), index,
                    "cancel settle exhausted");
                break;
            }
            tokio::time::sleep(self.config.cancel_sleep).await;
            retry -= 1;
        }

        let notify = {
            let mut q = queue.lock();
            let state = q.frame(index)?.state();
            match state {
                FrameState::Complete | FrameState::Free => {
                    warn!(stream = group.stream(), slot = %group.slot(), index, ?state,
                        "cancel raced a completion, nothing to do");
                    false
                }
                FrameState::Request => {
                    let frame = q.frame_mut(index)?;
                    frame.clear_out_bit(group.id().index() as u32);
                    frame.out_flag = 0;
                    frame.result = RESULT_CANCELLED;
                    q.force_complete(index)?;
                    true
                }
                FrameState::Process => {
                    let frame = q.frame_mut(index)?;
                    frame.clear_out_bit(group.id().index() as u32);
                    frame.out_flag = 0;
                    frame.result = RESULT_CANCELLED;
                    q.transition(index, FrameState::Complete)?;
                    true
                }
            }
        };
        if notify {
            self.consumer
                .done(group.stream(), group.id(), index, DoneStatus::Error(RESULT_CANCELLED));
        }
        Ok(())
    }
}

/// Stamp the dispatch onto the frame and move it to PROCESS
///
/// Returns the control block for the adapter and whether a torch request
/// newly latched.
fn stamp_frame(
    queue: &Arc<Mutex<FrameQueue>>,
    members: &[Arc<Group>],
    work: &Work,
    fcount: u32,
    noise_index: u32,
    torch_latched: bool,
) -> Result<(ShotMeta, bool)> {
    let mut q = queue.lock();
    let mut latched = false;
    {
        let frame = q.frame_mut(work.index)?;
        frame.fcount = fcount;
        frame.meta.noise_index_current = noise_index;
        match frame.meta.flash_mode {
            FlashMode::Torch => latched = true,
            FlashMode::Off if torch_latched => frame.meta.flash_mode = FlashMode::Torch,
            _ => {}
        }
        for member in members {
            frame.set_out_bit(member.id().index() as u32);
        }
        frame.latch_out_flag();
    }
    if !work.redispatch {
        q.transition(work.index, FrameState::Process)?;
    }
    let meta = q.frame(work.index)?.meta.clone();
    Ok((meta, latched))
}
