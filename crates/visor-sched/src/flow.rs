//! Flow ledger: ordering tokens for buffered hand-offs
//!
//! Peer-to-peer boundaries order themselves by construction; a buffered
//! boundary does not, because the downstream segment dispatches from its
//! own queue. The ledger closes that gap with a per-stream token pool:
//! the leader's shot takes a free token and stamps it with the frame
//! count, and every downstream segment head must find that token waiting
//! in its inbox before its own shot for the same count may proceed.
//!
//! A token ahead of the shot means frames were dropped upstream; the
//! ledger warns and rewinds past the stale tokens. A token that cannot be
//! found at all is a desync and cancels the frame.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};
use visor_hw::{Slot, StreamId};

use crate::error::{Result, SchedError};
use crate::group::GroupIx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowToken {
    fcount: u32,
}

/// Per-stream ordering-token pool
#[derive(Debug)]
pub struct FlowLedger {
    stream: StreamId,
    free: VecDeque<FlowToken>,
    inbox: HashMap<GroupIx, VecDeque<FlowToken>>,
    last_fcount: u32,
}

impl FlowLedger {
    /// Create a ledger with one token per queue slot
    #[must_use]
    pub fn new(stream: StreamId, capacity: u32) -> Self {
        Self {
            stream,
            free: (0..capacity).map(|_| FlowToken { fcount: 0 }).collect(),
            inbox: HashMap::new(),
            last_fcount: 0,
        }
    }

    /// Free tokens remaining
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Tokens parked in a segment head's inbox
    #[must_use]
    pub fn inbox_len(&self, head: GroupIx) -> usize {
        self.inbox.get(&head).map_or(0, VecDeque::len)
    }

    /// Leader shot: claim a free token and stamp it
    ///
    /// A leader running ahead of the ledger's expectation is resynced with
    /// a warning (frames were dropped before dispatch); a leader behind it
    /// would re-issue an already-tracked count and is rejected.
    pub fn check_pre_leader(&mut self, head: GroupIx, slot: Slot, fcount: u32) -> Result<()> {
        let expected = self.last_fcount + 1;
        if self.last_fcount != 0 {
            if fcount > expected {
                warn!(
                    stream = self.stream,
                    fcount, expected, "leader ran ahead of the ledger, resyncing"
                );
            } else if fcount < expected {
                return Err(SchedError::state(
                    self.stream,
                    slot,
                    format!("leader fcount {fcount} behind ledger expectation {expected}"),
                ));
            }
        }

        let Some(mut token) = self.free.pop_front() else {
            return Err(SchedError::FlowDesync { stream: self.stream, fcount });
        };
        token.fcount = fcount;
        self.inbox.entry(head).or_default().push_back(token);
        self.last_fcount = fcount;
        Ok(())
    }

    /// Downstream segment-head shot: match the inbox token for `fcount`
    ///
    /// Stale tokens older than the shot are dropped back to free with a
    /// warning (rewind); an inbox that cannot produce the count is a
    /// desync.
    pub fn check_pre_member(&mut self, head: GroupIx, fcount: u32) -> Result<()> {
        let inbox = self.inbox.entry(head).or_default();
        while let Some(front) = inbox.front() {
            if front.fcount < fcount {
                warn!(
                    stream = self.stream,
                    stale = front.fcount,
                    fcount,
                    "dropping stale flow token"
                );
                let stale = inbox.pop_front().unwrap_or(FlowToken { fcount: 0 });
                self.free.push_back(stale);
                continue;
            }
            if front.fcount == fcount {
                return Ok(());
            }
            break;
        }
        Err(SchedError::FlowDesync { stream: self.stream, fcount })
    }

    /// Shot dispatched: move the token downstream, or retire it
    ///
    /// The token retires when there is no next segment or when the next
    /// segment has no outstanding request to pair it with.
    pub fn check_post(&mut self, from: GroupIx, to: Option<GroupIx>, fcount: u32, requested: bool) {
        let inbox = self.inbox.entry(from).or_default();
        let Some(pos) = inbox.iter().position(|t| t.fcount == fcount) else {
            debug!(stream = self.stream, fcount, "no flow token to post");
            return;
        };
        let Some(token) = inbox.remove(pos) else {
            return;
        };

        match to {
            Some(next) if requested => self.inbox.entry(next).or_default().push_back(token),
            _ => self.free.push_back(token),
        }
    }

    /// Error completion: pull the token for `fcount` back to free
    pub fn recall(&mut self, head: GroupIx, fcount: u32) {
        let inbox = self.inbox.entry(head).or_default();
        if let Some(pos) = inbox.iter().position(|t| t.fcount == fcount) {
            if let Some(token) = inbox.remove(pos) {
                self.free.push_back(token);
            }
        }
    }

    /// Return every token to free (stream teardown)
    pub fn flush(&mut self) {
        for (_, mut inbox) in self.inbox.drain() {
            while let Some(token) = inbox.pop_front() {
                self.free.push_back(token);
            }
        }
        self.last_fcount = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: GroupIx = GroupIx(0);
    const NEXT: GroupIx = GroupIx(1);

    #[test]
    fn test_leader_token_flows_downstream() {
        let mut ledger = FlowLedger::new(0, 4);
        ledger.check_pre_leader(HEAD, Slot::Stat, 1).expect("leader");
        assert_eq!(ledger.inbox_len(HEAD), 1);

        ledger.check_post(HEAD, Some(NEXT), 1, true);
        assert_eq!(ledger.inbox_len(NEXT), 1);

        ledger.check_pre_member(NEXT, 1).expect("member match");
        ledger.check_post(NEXT, None, 1, false);
        assert_eq!(ledger.free_len(), 4);
    }

    #[test]
    fn test_member_rewinds_past_stale_tokens() {
        let mut ledger = FlowLedger::new(0, 4);
        for fcount in 1..=3 {
            ledger.check_pre_leader(HEAD, Slot::Stat, fcount).expect("leader");
            ledger.check_post(HEAD, Some(NEXT), fcount, true);
        }

        // Downstream only ever dispatches fcount 3; 1 and 2 are stale.
        ledger.check_pre_member(NEXT, 3).expect("rewind to match");
        assert_eq!(ledger.inbox_len(NEXT), 1);
        assert_eq!(ledger.free_len(), 3);
    }

    #[test]
    fn test_member_desync_when_no_token() {
        let mut ledger = FlowLedger::new(0, 4);
        let err = ledger.check_pre_member(NEXT, 5).expect_err("empty inbox");
        assert!(matches!(err, SchedError::FlowDesync { fcount: 5, .. }));
    }

    #[test]
    fn test_leader_behind_is_rejected_ahead_resyncs() {
        let mut ledger = FlowLedger::new(0, 4);
        ledger.check_pre_leader(HEAD, Slot::Stat, 5).expect("first");
        ledger.check_post(HEAD, None, 5, false);

        let err = ledger.check_pre_leader(HEAD, Slot::Stat, 4).expect_err("behind");
        assert!(matches!(err, SchedError::StateViolation { .. }));

        ledger.check_pre_leader(HEAD, Slot::Stat, 9).expect("ahead resyncs");
    }

    #[test]
    fn test_recall_and_flush() {
        let mut ledger = FlowLedger::new(0, 2);
        ledger.check_pre_leader(HEAD, Slot::Stat, 1).expect("leader");
        ledger.check_post(HEAD, Some(NEXT), 1, true);
        ledger.recall(NEXT, 1);
        assert_eq!(ledger.free_len(), 2);

        ledger.check_pre_leader(HEAD, Slot::Stat, 2).expect("leader again");
        ledger.flush();
        assert_eq!(ledger.free_len(), 2);
        assert_eq!(ledger.inbox_len(HEAD), 0);
    }
}
