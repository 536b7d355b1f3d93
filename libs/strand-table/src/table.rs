// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::action::Action;
use crate::event::MicroEvent;
use crate::node::{NodeSlots, Summary, TableNode, select_free_slot};
use crate::strand::{Strand, StrandInner, StrandStatus};
use crate::{CLASS_COUNT, NODE_SIZE_LOG2, StrandError, TableKind, WorkClass, WorkerId};
use core::sync::atomic::{AtomicI32, Ordering};
use spin::RwLock;
use std::sync::Arc;

/// Tunables of a strand table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrandTableConfig {
    /// When set, consumers stay out of a table whose per-class work counter
    /// says there is nothing to claim, limiting contention on the internal
    /// structures when there is little work to be found.
    pub contention_limit: bool,
}

/// A strand table: where all events that are being waited on are stored.
///
/// The table is a tree with an arity of [`crate::NODE_SIZE`], not always
/// full. It grows downward by materializing nodes as slots are consumed and
/// upward by inserting a new root above a fully occupied one. The root is
/// published through a reader-writer lock taken for writing only to mutate
/// the root itself; descents read the summary bitmaps without locks.
#[derive(Debug)]
pub struct StrandTable<M> {
    kind: TableKind,
    root: RwLock<Root<M>>,
    consumer_count: [AtomicI32; CLASS_COUNT],
    config: StrandTableConfig,
}

#[derive(Debug)]
struct Root<M> {
    head: Option<Arc<TableNode<M>>>,
    /// Number of levels; 0 means empty.
    levels: u32,
}

impl<M: Send> StrandTable<M> {
    #[must_use]
    pub fn new(kind: TableKind, config: StrandTableConfig) -> Self {
        Self {
            kind,
            root: RwLock::new(Root {
                head: None,
                levels: 0,
            }),
            consumer_count: [AtomicI32::new(0), AtomicI32::new(0)],
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub(crate) fn snapshot_root(&self) -> Option<(Arc<TableNode<M>>, u32)> {
        let root = self.root.read();
        root.head.clone().map(|head| (head, root.levels))
    }

    /// Grabs a free slot in the table and parks `event` in it.
    ///
    /// Descends the tree looking for free slots, spreading workers apart via
    /// a fudge factor seeded with the worker id and bumped on every retry.
    /// The returned strand is initialized with a runtime hold plus the given
    /// user properties (only [`StrandStatus::UHOLD`] is accepted) and with
    /// `WAIT_EVT` when the event is not ready yet.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when `props` carries anything but a user hold.
    pub fn get_new_strand(
        &self,
        worker: WorkerId,
        event: Box<MicroEvent<M>>,
        props: StrandStatus,
    ) -> Result<Arc<Strand<M>>, StrandError> {
        if !StrandStatus::UHOLD.contains(props) {
            return Err(StrandError::InvalidArg);
        }
        let mut event = Some(event);
        let mut fudge = worker;
        loop {
            let Some((head, levels)) = self.snapshot_root() else {
                self.bootstrap();
                continue;
            };

            if head.free_bits() == 0 {
                self.grow_up(&head);
                continue;
            }

            // Go down branches with free room. The loop restarts from the
            // top when a lock is contended or a race consumed the slot we
            // were after.
            let mut cur = head;
            let mut depth_remaining = levels - 1;
            let claimed = loop {
                if cur.is_leaf() {
                    break self.try_claim_leaf(&cur, &mut event, props, fudge);
                }
                let Some(mut guard) = cur.try_lock_slots() else {
                    break None;
                };
                let free = cur.free_bits();
                if free == 0 {
                    break None;
                }
                let slot = select_free_slot(
                    free,
                    [
                        cur.needs_process_bits(WorkClass::Work),
                        cur.needs_process_bits(WorkClass::Comm),
                    ],
                    cur.ready_bits(),
                    fudge,
                );
                let child = if let Some(child) = guard.child(slot) {
                    Arc::clone(child)
                } else {
                    let stride = 1u64 << (NODE_SIZE_LOG2 * depth_remaining);
                    let lm = cur.lm_base() + u64::from(slot) * stride;
                    let link = Some((Arc::downgrade(&cur), slot));
                    let child = if depth_remaining == 1 {
                        TableNode::new_leaf(self.kind, lm, link)
                    } else {
                        TableNode::new_interior(lm, link)
                    };
                    guard.set_child(slot, Arc::clone(&child));
                    child
                };
                drop(guard);
                cur = child;
                depth_remaining -= 1;
            };

            match claimed {
                Some(strand) => return Ok(strand),
                None => {
                    fudge = fudge.wrapping_add(1);
                }
            }
        }
    }

    /// Claims a free strand in `leaf`, or returns `None` when the leaf is
    /// contended or out of room (the caller restarts from the root).
    fn try_claim_leaf(
        &self,
        leaf: &Arc<TableNode<M>>,
        event: &mut Option<Box<MicroEvent<M>>>,
        props: StrandStatus,
        fudge: u32,
    ) -> Option<Arc<Strand<M>>> {
        let guard = leaf.try_lock_slots()?;
        let free = leaf.free_bits();
        if free == 0 {
            return None;
        }
        let slot = select_free_slot(
            free,
            [
                leaf.needs_process_bits(WorkClass::Work),
                leaf.needs_process_bits(WorkClass::Comm),
            ],
            leaf.ready_bits(),
            fudge,
        );
        let strand = Arc::clone(guard.leaf_strand(slot));
        let mut st = strand.try_lock()?;
        debug_assert!(st.status.is_free(), "free bit set on occupied strand");

        let mut owned = event.take().expect("claim retried after success");
        let mut status = StrandStatus::RHOLD | props;
        if !owned.is_ready() {
            status.insert(StrandStatus::WAIT_EVT);
        }
        owned.set_strand(Some(strand.id()));
        st.status = status;
        st.event = Some(owned);
        st.processing_worker = None;

        leaf.summary_clear_locked(Summary::Free, slot);
        if !st.status.intersects(StrandStatus::WAIT) {
            leaf.summary_set_locked(Summary::Ready, slot);
        }
        drop(st);
        drop(guard);
        tracing::trace!(table = ?self.kind, index = strand.index(), "claimed strand");
        Some(strand)
    }

    /// Creates the initial two levels of an empty table. Building two levels
    /// at once keeps the root lock cold during the first insertions.
    fn bootstrap(&self) {
        let mut root = self.root.write();
        if root.head.is_some() {
            return;
        }
        let head = TableNode::new_interior(0, None);
        let leaf = TableNode::new_leaf(self.kind, 0, Some((Arc::downgrade(&head), 0)));
        head.lock_slots().set_child(0, leaf);
        root.head = Some(head);
        root.levels = 2;
        tracing::debug!(table = ?self.kind, "strand table bootstrapped with two levels");
    }

    /// Inserts a new root above a fully occupied one. The table lock is held
    /// across the swap and the old head is re-checked for identity so that
    /// two producers cannot both grow the table.
    fn grow_up(&self, old_head: &Arc<TableNode<M>>) {
        let new_head = TableNode::new_interior(0, None);
        let mut root = self.root.write();
        match &root.head {
            Some(head) if Arc::ptr_eq(head, old_head) => {}
            _ => return,
        }
        {
            let mut new_slots = new_head.lock_slots();
            let _old_slots = old_head.lock_slots();
            new_head.adopt_as_slot_zero(old_head);
            old_head.set_parent(&new_head, 0);
            new_slots.set_child(0, Arc::clone(old_head));
        }
        root.levels += 1;
        root.head = Some(new_head);
        tracing::debug!(table = ?self.kind, levels = root.levels, "strand table grew upward");
    }

    /// Looks up the strand stored at `index`.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the index lies outside the currently materialized
    /// tree.
    pub fn strand_for_index(&self, index: u64) -> Result<Arc<Strand<M>>, StrandError> {
        let Some((head, levels)) = self.snapshot_root() else {
            return Err(StrandError::InvalidArg);
        };
        let span_log2 = NODE_SIZE_LOG2 * levels;
        if span_log2 < u64::BITS && index >> span_log2 != 0 {
            return Err(StrandError::InvalidArg);
        }
        let mut cur = head;
        let mut depth_remaining = levels - 1;
        loop {
            #[expect(clippy::cast_possible_truncation, reason = "masked to 6 bits")]
            let slot = ((index >> (NODE_SIZE_LOG2 * depth_remaining))
                & ((1 << NODE_SIZE_LOG2) - 1)) as u32;
            let guard = cur.lock_slots();
            if cur.is_leaf() {
                return Ok(Arc::clone(guard.leaf_strand(slot)));
            }
            let Some(child) = guard.child(slot).map(Arc::clone) else {
                return Err(StrandError::InvalidArg);
            };
            drop(guard);
            cur = child;
            depth_remaining -= 1;
        }
    }

    /// Appends `actions` to the strand's pending work.
    ///
    /// If another worker is currently processing the strand, the actions go
    /// to the buffered side queue and are merged when that run ends. If this
    /// is the first pending work and the strand's event is already ready, the
    /// strand moves from the ready map to the needs-process map of the head
    /// action's class. `clear_fwd_hold` drops the runtime hold, letting the
    /// strand disappear once drained.
    ///
    /// # Errors
    ///
    /// `Busy` when the strand slot is free (stale handle).
    pub fn enqueue_actions(
        &self,
        worker: WorkerId,
        strand: &Arc<Strand<M>>,
        actions: Vec<Action<M>>,
        clear_fwd_hold: bool,
    ) -> Result<(), StrandError> {
        let mut st = strand.lock();
        if st.status.is_free() {
            return Err(StrandError::Busy);
        }

        match st.processing_worker {
            Some(w) if w != worker => {
                // Remote processor owns the action queue; buffer on the side.
                let mut buf = strand.buffered();
                buf.actions.extend(actions);
                buf.hold_clear |= clear_fwd_hold;
                st.status.insert(StrandStatus::MODIFIED);
                tracing::trace!(index = strand.index(), "buffered actions on busy strand");
                return Ok(());
            }
            _ => {}
        }

        let was_empty = st.actions.is_empty();
        let head_class = actions.first().map(Action::class);
        st.actions.extend(actions);

        if was_empty && !st.actions.is_empty() {
            st.status.insert(StrandStatus::WAIT_ACT);
            if !st.status.contains(StrandStatus::WAIT_EVT) && st.processing_worker.is_none() {
                let class = head_class.expect("actions were just appended");
                let leaf = strand.parent();
                let guard = leaf.lock_slots();
                leaf.summary_clear_locked(Summary::Ready, strand.slot());
                leaf.summary_set_locked(Summary::NeedsProcess(class), strand.slot());
                drop(guard);
                self.note_produced(class);
            }
        }

        if clear_fwd_hold {
            st.status.remove(StrandStatus::RHOLD);
            if st.status.can_release() && st.processing_worker.is_none() {
                self.release_locked(strand, &mut st);
            }
        }
        Ok(())
    }

    /// Returns the strand to the free pool. Caller must hold the strand lock
    /// and the strand must be fully drained and unheld.
    pub(crate) fn release_locked(&self, strand: &Arc<Strand<M>>, st: &mut StrandInner<M>) {
        debug_assert!(st.status.can_release());
        debug_assert!(st.actions.is_empty());
        if let Some(event) = st.event.take() {
            // The strand owns its final event unless someone resolved it out
            // earlier; dropping here is the garbage collection point.
            tracing::trace!(
                index = strand.index(),
                gc = event.props().contains(crate::EventProps::GC),
                "dropping event with released strand"
            );
            drop(event);
        }
        st.status = StrandStatus::empty();
        st.processing_worker = None;
        st.context_task = 0;

        let leaf = strand.parent();
        let guard = leaf.lock_slots();
        leaf.summary_clear_locked(Summary::Ready, strand.slot());
        leaf.summary_set_locked(Summary::Free, strand.slot());
        drop(guard);
        tracing::trace!(table = ?self.kind, index = strand.index(), "released strand");
    }

    pub(crate) fn note_produced(&self, class: WorkClass) {
        if self.config.contention_limit {
            self.consumer_count[class.idx()].fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn note_consumed(&self, class: WorkClass) {
        if self.config.contention_limit {
            self.consumer_count[class.idx()].fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Whether a consumer should bother entering the table for `class` work.
    pub(crate) fn consumer_may_enter(&self, class: WorkClass) -> bool {
        !self.config.contention_limit || self.consumer_count[class.idx()].load(Ordering::Acquire) > 0
    }

    /// Drops the whole tree. All strands must be free; teardown drains the
    /// tables first.
    pub(crate) fn reset(&self) {
        let mut root = self.root.write();
        debug_assert!(
            root.head
                .as_ref()
                .is_none_or(|head| subtree_is_free(head)),
            "strand table reset with live strands"
        );
        root.head = None;
        root.levels = 0;
    }
}

/// Walks the subtree checking that every strand is free and that the free
/// summary bitmap agrees with a linear scan of the actual slots.
pub(crate) fn subtree_is_free<M>(node: &Arc<TableNode<M>>) -> bool {
    let guard = node.lock_slots();
    match &*guard {
        NodeSlots::Leaf(strands) => {
            let mut scanned = 0u64;
            for (i, strand) in strands.iter().enumerate() {
                if strand.status().is_free() {
                    scanned |= 1 << i;
                }
            }
            scanned == u64::MAX && scanned == node.free_bits()
        }
        NodeSlots::Interior(children) => children.iter().flatten().all(subtree_is_free),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;
    use crate::{NODE_SIZE, StrandId};

    fn ready_event() -> Box<MicroEvent<u32>> {
        Box::new(MicroEvent::new_ready(EventData::Control))
    }

    fn pending_event() -> Box<MicroEvent<u32>> {
        Box::new(MicroEvent::new(EventData::Control))
    }

    #[test]
    fn first_insert_bootstraps_two_levels() {
        let table = StrandTable::<u32>::new(TableKind::Event, StrandTableConfig::default());
        let strand = table
            .get_new_strand(0, pending_event(), StrandStatus::empty())
            .unwrap();
        assert_eq!(strand.status(), StrandStatus::RHOLD | StrandStatus::WAIT_EVT);
        let (_, levels) = table.snapshot_root().unwrap();
        assert_eq!(levels, 2);
    }

    #[test]
    fn ready_event_sets_ready_summary() {
        let table = StrandTable::<u32>::new(TableKind::Event, StrandTableConfig::default());
        let strand = table
            .get_new_strand(0, ready_event(), StrandStatus::UHOLD)
            .unwrap();
        assert!(strand.status().contains(StrandStatus::UHOLD));
        let leaf = strand.parent();
        assert_eq!(leaf.ready_bits() & (1 << strand.slot()), 1 << strand.slot());
    }

    #[test]
    fn strand_lookup_by_index() {
        let table = StrandTable::<u32>::new(TableKind::Event, StrandTableConfig::default());
        let strand = table
            .get_new_strand(3, pending_event(), StrandStatus::empty())
            .unwrap();
        let found = table.strand_for_index(strand.index()).unwrap();
        assert_eq!(found.id(), strand.id());
        assert_eq!(
            found.id(),
            StrandId {
                table: TableKind::Event,
                index: strand.index()
            }
        );

        // Context travels with the slot, visible through any handle.
        strand.set_context_task(42);
        assert_eq!(found.context_task(), 42);
    }

    #[test]
    fn fills_multiple_leaves() {
        let table = StrandTable::<u32>::new(TableKind::Comm, StrandTableConfig::default());
        let mut strands = Vec::new();
        // More strands than one leaf holds; forces downward growth.
        for w in 0..(NODE_SIZE * 3) {
            #[expect(clippy::cast_possible_truncation, reason = "test range is small")]
            let worker = w as u32;
            strands.push(
                table
                    .get_new_strand(worker, pending_event(), StrandStatus::empty())
                    .unwrap(),
            );
        }
        // All indices distinct.
        let mut seen = strands.iter().map(|s| s.index()).collect::<Vec<_>>();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), NODE_SIZE * 3);
        // Comm strands carry a communication buffer.
        assert!(strands[0].comm_buffer().is_some());
    }

    #[test]
    fn rejects_bad_props() {
        let table = StrandTable::<u32>::new(TableKind::Event, StrandTableConfig::default());
        assert_eq!(
            table
                .get_new_strand(0, pending_event(), StrandStatus::MODIFIED)
                .unwrap_err(),
            StrandError::InvalidArg
        );
    }
}
