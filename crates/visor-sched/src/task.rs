//! Per-stage worker and admission state
//!
//! One [`GroupTask`] exists per physical stage id and is multiplexed
//! across every stream whose group binds to that id. It owns the
//! admission semaphore, the pending-work queue its worker drains, and the
//! stop machinery that releases parked admission waiters.
//!
//! The pending queue is a plain deque behind a mutex, kicked by a
//! `Notify`, rather than a channel: the drain protocol needs to flush one
//! group's entries out of it, and a channel cannot be selectively
//! emptied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use visor_hw::StageId;

use crate::config::TaskPriority;
use crate::group::GroupIx;

/// Task condition flags
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlag {
    /// Worker is running and accepting work
    Start,
    /// Stop requested; admission waiters must bail out
    RequestStop,
}

/// One unit of pending dispatch work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Work {
    /// Group the frame belongs to
    pub group: GroupIx,
    /// Frame index within the group's queue
    pub index: u32,
    /// Re-trigger of a frame already in PROCESS (stripe/repeat pass)
    pub redispatch: bool,
}

/// Worker and admission state for one physical stage
#[derive(Debug)]
pub struct GroupTask {
    id: StageId,
    priority: TaskPriority,
    refcount: AtomicU32,
    flags: Mutex<BitFlags<TaskFlag>>,
    /// Replaced wholesale when a group start sets a new budget
    resource: Mutex<Arc<Semaphore>>,
    budget: AtomicU32,
    pending: Mutex<VecDeque<Work>>,
    /// Wakes the worker when work arrives or stop is requested
    pub(crate) kick: Notify,
    /// Wakes admission waiters parked in a shot
    pub(crate) stop: Notify,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl GroupTask {
    pub(crate) fn new(id: StageId, priority: TaskPriority) -> Self {
        Self {
            id,
            priority,
            refcount: AtomicU32::new(0),
            flags: Mutex::new(BitFlags::empty()),
            resource: Mutex::new(Arc::new(Semaphore::new(0))),
            budget: AtomicU32::new(0),
            pending: Mutex::new(VecDeque::new()),
            kick: Notify::new(),
            stop: Notify::new(),
            worker: Mutex::new(None),
        }
    }

    /// Physical stage this task serves
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Recorded priority class
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Streams currently bound to this task
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Bind one more stream; returns the new count
    pub(crate) fn acquire(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Unbind a stream; returns the new count
    pub(crate) fn release(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "task {} refcount underflow", self.id);
        prev - 1
    }

    /// Whether `flag` is set
    #[must_use]
    pub fn has(&self, flag: TaskFlag) -> bool {
        self.flags.lock().contains(flag)
    }

    pub(crate) fn set(&self, flag: TaskFlag) {
        self.flags.lock().insert(flag);
    }

    pub(crate) fn clear(&self, flag: TaskFlag) {
        self.flags.lock().remove(flag);
    }

    /// Current admission budget
    #[must_use]
    pub fn budget(&self) -> u32 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Available admission permits
    #[must_use]
    pub fn available(&self) -> u32 {
        self.resource.lock().available_permits() as u32
    }

    /// Replace the admission semaphore with a fresh budget
    ///
    /// Any permit held against the old semaphore releases into the old
    /// instance and is dropped with it, so a budget change while shots are
    /// in flight cannot corrupt the new accounting.
    pub(crate) fn set_budget(&self, budget: u32) {
        *self.resource.lock() = Arc::new(Semaphore::new(budget as usize));
        self.budget.store(budget, Ordering::SeqCst);
    }

    /// Handle to the current admission semaphore
    pub(crate) fn resource(&self) -> Arc<Semaphore> {
        Arc::clone(&self.resource.lock())
    }

    /// Return one permit to the current semaphore
    pub(crate) fn release_permit(&self) {
        self.resource.lock().add_permits(1);
    }

    /// Queue work for the worker and kick it
    pub(crate) fn push(&self, work: Work) {
        self.pending.lock().push_back(work);
        self.kick.notify_one();
    }

    /// Take the next pending work item
    pub(crate) fn pop(&self) -> Option<Work> {
        self.pending.lock().pop_front()
    }

    /// Pending work items
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending entry belonging to `group`
    ///
    /// Only the drain protocol calls this.
    pub(crate) fn flush(&self, group: GroupIx) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|w| w.group != group);
        before - pending.len()
    }

    /// Request stop: flag, wake the worker, release admission waiters
    pub(crate) fn request_stop(&self) {
        self.set(TaskFlag::RequestStop);
        self.kick.notify_one();
        self.stop.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_hw::Slot;

    fn task() -> GroupTask {
        GroupTask::new(StageId::new(Slot::Isp, 0), TaskPriority::Normal)
    }

    #[test]
    fn test_refcount_binding() {
        let task = task();
        assert_eq!(task.acquire(), 1);
        assert_eq!(task.acquire(), 2);
        assert_eq!(task.release(), 1);
        assert_eq!(task.release(), 0);
    }

    #[test]
    fn test_flush_removes_only_target_group() {
        let task = task();
        task.push(Work { group: GroupIx(0), index: 0, redispatch: false });
        task.push(Work { group: GroupIx(1), index: 1, redispatch: false });
        task.push(Work { group: GroupIx(0), index: 2, redispatch: false });

        assert_eq!(task.flush(GroupIx(0)), 2);
        assert_eq!(task.pending_len(), 1);
        assert_eq!(task.pop().map(|w| w.group), Some(GroupIx(1)));
    }

    #[test]
    fn test_budget_replacement() {
        let task = task();
        task.set_budget(3);
        assert_eq!(task.budget(), 3);
        assert_eq!(task.available(), 3);

        let sem = task.resource();
        let permit = sem.try_acquire_owned().expect("permit");
        assert_eq!(task.available(), 2);
        permit.forget();
        task.release_permit();
        assert_eq!(task.available(), 3);
    }

    #[tokio::test]
    async fn test_request_stop_wakes_admission_waiter() {
        let task = Arc::new(task());
        task.set_budget(0);

        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let sem = task.resource();
                tokio::select! {
                    _ = sem.acquire_owned() => false,
                    _ = task.stop.notified() => true,
                }
            })
        };

        tokio::task::yield_now().await;
        task.request_stop();
        assert!(waiter.await.expect("join"), "waiter released by stop");
        assert!(task.has(TaskFlag::RequestStop));
    }
}
