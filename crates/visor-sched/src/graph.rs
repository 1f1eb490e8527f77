//! Pipeline graph construction
//!
//! Derives the full link structure of a stream from its open groups in
//! pipeline order. A peer-input group (OTF/VOTF) continues the current
//! segment as a child sharing the head's queue and hardware transaction;
//! a memory-input group starts a new segment head linked to the previous
//! one through the flow ledger (`gnext`/`gprev`), unless the group opts
//! out of flow tracking.
//!
//! Construction failures are the fatal class: a chain that cannot be
//! linked is rejected at build, never surfaced per-frame.

use std::sync::Arc;

use tracing::debug;
use visor_frame::ConsistencyError;
use visor_hw::StreamId;

use crate::arena::GroupArena;
use crate::error::Result;
use crate::group::{Group, GroupFlag, GroupInput, GroupIx, GroupLinks};

fn invariant(detail: impl Into<String>) -> ConsistencyError {
    ConsistencyError::Invariant { detail: detail.into() }
}

/// Rebuild every link of a stream's chain
///
/// Resets all links first, so a rebuild after close/open cannot keep
/// stale indices. The leader must be the first open stage of the stream.
pub(crate) fn build_stream(
    arena: &GroupArena,
    stream: StreamId,
    leader: GroupIx,
) -> Result<()> {
    let groups = arena.stream_groups(stream);
    if groups.is_empty() {
        return Err(invariant(format!("stream {stream} has no open groups")).into());
    }
    if groups[0].ix() != leader {
        return Err(invariant(format!(
            "stream {stream} leader is not its first open stage"
        ))
        .into());
    }

    for group in &groups {
        group.update_links(|links| *links = GroupLinks::default());
        group.clear(GroupFlag::OtfOutput);
        group.clear(GroupFlag::VotfOutput);
    }
    link_chain(stream, &groups)?;

    let twins = arena.stream_parallel(stream);
    if !twins.is_empty() {
        for twin in &twins {
            twin.update_links(|links| *links = GroupLinks::default());
            twin.clear(GroupFlag::OtfOutput);
            twin.clear(GroupFlag::VotfOutput);
            twin.set(GroupFlag::MultiChannel);
        }
        link_chain(stream, &twins)?;

        // The parallel chain duplicates the logical stream: it dispatches
        // from the leader's queue, not from queues of its own.
        let shared = groups[0].queue();
        for twin in &twins {
            twin.set_queue(shared.clone());
        }

        let (first, last) = (twins[0].ix(), twins[twins.len() - 1].ix());
        groups[0].update_links(|links| {
            links.pnext = Some(first);
            links.ptail = Some(last);
        });
        groups[0].set(GroupFlag::MultiChannel);
    }

    debug!(stream, groups = groups.len(), twins = twins.len(), "stream graph built");
    Ok(())
}

/// Link one ordered chain: next/prev, segments, and the ledger hand-offs
fn link_chain(stream: StreamId, groups: &[Arc<Group>]) -> Result<()> {
    if groups[0].input() == GroupInput::Votf {
        return Err(invariant(format!(
            "stream {stream} leader {} declares VOTF input with no upstream",
            groups[0].slot()
        ))
        .into());
    }

    for pair in groups.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        prev.update_links(|links| links.next = Some(next.ix()));
        next.update_links(|links| links.prev = Some(prev.ix()));
    }

    let mut segment: Vec<&Arc<Group>> = vec![&groups[0]];
    let mut tracked_head: Option<GroupIx> = None;
    groups[0].update_links(|links| links.head = Some(groups[0].ix()));

    for i in 1..groups.len() {
        let group = &groups[i];
        let prev = &groups[i - 1];

        if group.peer_input() {
            if group.input() == GroupInput::Otf
                && prev.slot().index() + 1 != group.slot().index()
            {
                return Err(invariant(format!(
                    "stream {stream}: {} cannot take OTF input from non-adjacent {}",
                    group.slot(),
                    prev.slot()
                ))
                .into());
            }
            let head = segment[0];
            // The upstream side of a peer-to-peer boundary mirrors the
            // downstream's declared input mode.
            prev.set(match group.input() {
                GroupInput::Otf => GroupFlag::OtfOutput,
                _ => GroupFlag::VotfOutput,
            });
            prev.update_links(|links| links.child = Some(group.ix()));
            group.update_links(|links| {
                links.parent = Some(prev.ix());
                links.head = Some(head.ix());
            });
            group.set_queue(head.queue());
            segment.push(group);
            continue;
        }

        // Memory input: close the running segment and start a new head.
        close_segment(&segment);
        let old_head = segment[0];
        if !old_head.flow_skip() {
            tracked_head = Some(old_head.ix());
        }
        if !group.flow_skip() {
            if let Some(upstream_ix) = tracked_head {
                if let Some(upstream) = groups.iter().find(|g| g.ix() == upstream_ix) {
                    upstream.update_links(|links| links.gnext = Some(group.ix()));
                    group.update_links(|links| links.gprev = Some(upstream_ix));
                }
            }
        }
        group.update_links(|links| links.head = Some(group.ix()));
        segment = vec![group];
    }
    close_segment(&segment);
    Ok(())
}

fn close_segment(segment: &[&Arc<Group>]) {
    let tail = segment[segment.len() - 1].ix();
    for member in segment {
        member.update_links(|links| links.tail = Some(tail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use visor_frame::FrameQueue;
    use visor_hw::{Slot, StageId};

    fn open(
        arena: &mut GroupArena,
        stream: StreamId,
        slot: Slot,
        input: GroupInput,
    ) -> Arc<Group> {
        let group = arena.insert(stream, slot, StageId::new(slot, 0)).expect("open");
        group.set_input(input);
        group.set_queue(Some(Arc::new(Mutex::new(FrameQueue::new(0, 4)))));
        group
    }

    #[test]
    fn test_segments_and_handoffs() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        let isp = open(&mut arena, 0, Slot::Isp, GroupInput::Otf);
        let scaler = open(&mut arena, 0, Slot::Scaler, GroupInput::Memory);
        let detect = open(&mut arena, 0, Slot::Detect, GroupInput::Memory);

        build_stream(&arena, 0, stat.ix()).expect("build");

        // stat+isp share one segment and one queue.
        assert_eq!(stat.links().child, Some(isp.ix()));
        assert_eq!(isp.links().parent, Some(stat.ix()));
        assert_eq!(isp.links().head, Some(stat.ix()));
        assert_eq!(stat.links().tail, Some(isp.ix()));
        assert!(Arc::ptr_eq(&stat.queue().expect("q"), &isp.queue().expect("q")));

        // scaler is a new head behind a buffered boundary.
        assert_eq!(stat.links().gnext, Some(scaler.ix()));
        assert_eq!(scaler.links().gprev, Some(stat.ix()));
        assert_eq!(scaler.links().head, Some(scaler.ix()));

        // detect opts out of flow tracking.
        assert_eq!(detect.links().gprev, None);
        assert_eq!(scaler.links().gnext, None);
    }

    #[test]
    fn test_peer_boundary_sets_output_flags() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        let isp = open(&mut arena, 0, Slot::Isp, GroupInput::Otf);
        let scaler = open(&mut arena, 0, Slot::Scaler, GroupInput::Votf);

        build_stream(&arena, 0, stat.ix()).expect("build");
        assert!(stat.has(GroupFlag::OtfOutput));
        assert!(isp.has(GroupFlag::VotfOutput));
        assert!(!scaler.has(GroupFlag::OtfOutput));

        // A rebuild after the chain flattens to buffered boundaries must
        // drop the stale output flags.
        isp.set_input(GroupInput::Memory);
        scaler.set_input(GroupInput::Memory);
        build_stream(&arena, 0, stat.ix()).expect("rebuild");
        assert!(!stat.has(GroupFlag::OtfOutput));
        assert!(!isp.has(GroupFlag::VotfOutput));
    }

    #[test]
    fn test_non_adjacent_otf_is_fatal() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        open(&mut arena, 0, Slot::Scaler, GroupInput::Otf);

        let err = build_stream(&arena, 0, stat.ix()).expect_err("gap");
        assert!(matches!(
            err,
            crate::SchedError::Consistency(ConsistencyError::Invariant { .. })
        ));
    }

    #[test]
    fn test_votf_bridges_non_adjacent_stages() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        let scaler = open(&mut arena, 0, Slot::Scaler, GroupInput::Votf);

        build_stream(&arena, 0, stat.ix()).expect("votf bridges the gap");
        assert_eq!(stat.links().child, Some(scaler.ix()));
        assert_eq!(scaler.links().head, Some(stat.ix()));
    }

    #[test]
    fn test_parallel_chain_links() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        let isp = open(&mut arena, 0, Slot::Isp, GroupInput::Otf);
        let twin = arena
            .insert_parallel(0, Slot::Stat, StageId::new(Slot::Stat, 1))
            .expect("twin");
        twin.set_input(GroupInput::Memory);

        build_stream(&arena, 0, stat.ix()).expect("build");
        assert_eq!(stat.links().pnext, Some(twin.ix()));
        assert_eq!(stat.links().ptail, Some(twin.ix()));
        assert!(twin.has(GroupFlag::MultiChannel));
        assert!(Arc::ptr_eq(&twin.queue().expect("q"), &stat.queue().expect("q")));
        assert_eq!(isp.links().head, Some(stat.ix()));
    }

    #[test]
    fn test_rebuild_resets_stale_links() {
        let mut arena = GroupArena::new();
        let stat = open(&mut arena, 0, Slot::Stat, GroupInput::Memory);
        let isp = open(&mut arena, 0, Slot::Isp, GroupInput::Otf);
        build_stream(&arena, 0, stat.ix()).expect("first build");

        isp.set_input(GroupInput::Memory);
        build_stream(&arena, 0, stat.ix()).expect("rebuild");
        assert_eq!(stat.links().child, None);
        assert_eq!(stat.links().gnext, Some(isp.ix()));
    }
}
