// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::strand::Strand;
use crate::{CLASS_COUNT, NODE_SIZE, TableKind, WorkClass};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard, RwLock};
use std::sync::{Arc, Weak};

/// One node of a strand table tree.
///
/// The summary bitmaps are published atomically so the hot-path descent can
/// read them without taking the node lock; a bit observed set stays set until
/// the lock holder that clears it releases the node lock. All bitmap writes
/// happen under [`TableNode::lock`].
pub(crate) struct TableNode<M> {
    /// Index of the leftmost strand contained in this subtree.
    lm_base: u64,
    leaf: bool,
    /// Bit i set iff child i has at least one free descendant slot.
    /// Unmaterialized children count as free.
    node_free: AtomicU64,
    /// Bit i set iff child i has at least one strand that is fully ready
    /// (event ready, no pending actions, kept by a hold).
    node_ready: AtomicU64,
    /// Per work class: bit i set iff child i has at least one strand whose
    /// head action is of that class and whose event is ready.
    needs_process: [AtomicU64; CLASS_COUNT],
    parent: RwLock<Option<ParentLink<M>>>,
    slots: Mutex<NodeSlots<M>>,
}

pub(crate) struct ParentLink<M> {
    pub node: Weak<TableNode<M>>,
    pub slot: u32,
}

pub(crate) enum NodeSlots<M> {
    /// Leaf nodes hold their strands directly; all strands are preallocated
    /// with the node.
    Leaf([Arc<Strand<M>>; NODE_SIZE]),
    /// Interior nodes hold children, lazily materialized as slots are
    /// consumed.
    Interior([Option<Arc<TableNode<M>>>; NODE_SIZE]),
}

/// Which summary bitmap an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Summary {
    Free,
    Ready,
    NeedsProcess(WorkClass),
}

impl<M> TableNode<M> {
    /// Creates a leaf with all 64 strands preallocated and free.
    pub(crate) fn new_leaf(
        table: TableKind,
        lm_base: u64,
        parent: Option<(Weak<TableNode<M>>, u32)>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            lm_base,
            leaf: true,
            node_free: AtomicU64::new(u64::MAX),
            node_ready: AtomicU64::new(0),
            needs_process: [AtomicU64::new(0), AtomicU64::new(0)],
            parent: RwLock::new(parent.map(|(node, slot)| ParentLink { node, slot })),
            slots: Mutex::new(NodeSlots::Leaf(core::array::from_fn(|i| {
                Arc::new(Strand::new_free(table, lm_base + i as u64, me.clone()))
            }))),
        })
    }

    /// Creates an interior node with no materialized children. All slots
    /// start out free.
    pub(crate) fn new_interior(
        lm_base: u64,
        parent: Option<(Weak<TableNode<M>>, u32)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            lm_base,
            leaf: false,
            node_free: AtomicU64::new(u64::MAX),
            node_ready: AtomicU64::new(0),
            needs_process: [AtomicU64::new(0), AtomicU64::new(0)],
            parent: RwLock::new(parent.map(|(node, slot)| ParentLink { node, slot })),
            slots: Mutex::new(NodeSlots::Interior(core::array::from_fn(|_| None))),
        })
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf
    }

    #[inline]
    pub(crate) fn lm_base(&self) -> u64 {
        self.lm_base
    }

    #[inline]
    pub(crate) fn free_bits(&self) -> u64 {
        self.node_free.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn ready_bits(&self) -> u64 {
        self.node_ready.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn needs_process_bits(&self, class: WorkClass) -> u64 {
        self.needs_process[class.idx()].load(Ordering::Acquire)
    }

    pub(crate) fn lock_slots(&self) -> MutexGuard<'_, NodeSlots<M>> {
        self.slots.lock()
    }

    pub(crate) fn try_lock_slots(&self) -> Option<MutexGuard<'_, NodeSlots<M>>> {
        self.slots.try_lock()
    }

    pub(crate) fn parent_link(&self) -> Option<(Arc<TableNode<M>>, u32)> {
        let guard = self.parent.read();
        let link = guard.as_ref()?;
        let node = link.node.upgrade()?;
        Some((node, link.slot))
    }

    /// Rewires the parent link; used when a new root is inserted above the
    /// current one. Caller must hold the table lock.
    pub(crate) fn set_parent(&self, node: &Arc<TableNode<M>>, slot: u32) {
        *self.parent.write() = Some(ParentLink {
            node: Arc::downgrade(node),
            slot,
        });
    }

    fn summary(&self, which: Summary) -> &AtomicU64 {
        match which {
            Summary::Free => &self.node_free,
            Summary::Ready => &self.node_ready,
            Summary::NeedsProcess(class) => &self.needs_process[class.idx()],
        }
    }

    /// Sets `bit` in the chosen summary of this node, assuming the caller
    /// already holds this node's slot lock. Propagation continues upward only
    /// while a summary transitioned from empty to non-empty, taking each
    /// ancestor's lock hand-over-hand (child lock held while the parent lock
    /// is acquired, which is the one legal ascent order).
    pub(crate) fn summary_set_locked(&self, which: Summary, bit: u32) {
        let map = self.summary(which);
        let old = map.load(Ordering::Relaxed);
        if old & (1 << bit) != 0 {
            return;
        }
        map.store(old | (1 << bit), Ordering::Release);
        if old != 0 {
            return;
        }
        if let Some((parent, slot)) = self.parent_link() {
            summary_set(&parent, which, slot);
        }
    }

    /// Clears `bit` in the chosen summary, assuming the caller holds this
    /// node's slot lock. Propagation continues upward only while the summary
    /// became empty.
    pub(crate) fn summary_clear_locked(&self, which: Summary, bit: u32) {
        let map = self.summary(which);
        let old = map.load(Ordering::Relaxed);
        if old & (1 << bit) == 0 {
            return;
        }
        let new = old & !(1 << bit);
        map.store(new, Ordering::Release);
        if new != 0 {
            return;
        }
        if let Some((parent, slot)) = self.parent_link() {
            summary_clear(&parent, which, slot);
        }
    }

    /// Copies the aggregate state of `child` (which is about to become slot 0
    /// of `self`, the new root). Caller holds the table lock and both nodes'
    /// slot locks, so the child's summaries cannot move under us.
    pub(crate) fn adopt_as_slot_zero(&self, child: &TableNode<M>) {
        let free = u64::from(child.node_free.load(Ordering::Relaxed) != 0);
        self.node_free
            .store((u64::MAX & !1) | free, Ordering::Release);
        self.node_ready.store(
            u64::from(child.node_ready.load(Ordering::Relaxed) != 0),
            Ordering::Release,
        );
        for i in 0..CLASS_COUNT {
            self.needs_process[i].store(
                u64::from(child.needs_process[i].load(Ordering::Relaxed) != 0),
                Ordering::Release,
            );
        }
    }
}

impl<M> core::fmt::Debug for TableNode<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableNode")
            .field("lm_base", &self.lm_base)
            .field("leaf", &self.leaf)
            .field("node_free", &self.node_free.load(Ordering::Relaxed))
            .field("node_ready", &self.node_ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Locked entry points for ascent from a child that does *not* already hold
/// the target node's lock.
pub(crate) fn summary_set<M>(node: &Arc<TableNode<M>>, which: Summary, bit: u32) {
    let _guard = node.lock_slots();
    node.summary_set_locked(which, bit);
}

pub(crate) fn summary_clear<M>(node: &Arc<TableNode<M>>, which: Summary, bit: u32) {
    let _guard = node.lock_slots();
    node.summary_clear_locked(which, bit);
}

impl<M> NodeSlots<M> {
    pub(crate) fn leaf_strand(&self, slot: u32) -> &Arc<Strand<M>> {
        match self {
            NodeSlots::Leaf(strands) => &strands[slot as usize],
            NodeSlots::Interior(_) => unreachable!("leaf access on interior node"),
        }
    }

    pub(crate) fn child(&self, slot: u32) -> Option<&Arc<TableNode<M>>> {
        match self {
            NodeSlots::Interior(children) => children[slot as usize].as_ref(),
            NodeSlots::Leaf(_) => unreachable!("child access on leaf node"),
        }
    }

    pub(crate) fn set_child(&mut self, slot: u32, node: Arc<TableNode<M>>) {
        match self {
            NodeSlots::Interior(children) => {
                debug_assert!(children[slot as usize].is_none());
                children[slot as usize] = Some(node);
            }
            NodeSlots::Leaf(_) => unreachable!("child insert on leaf node"),
        }
    }
}

/// Picks a free slot, spreading producers apart.
///
/// The 64-bit free map is divided into quadrants; the quadrant selected by
/// the fudge factor (worker id + retry count) is searched first, preferring
/// slots that are also absent from both needs-process maps and from the
/// ready map so that producers and consumers land in different subtrees.
/// Constraints are loosened in popcount order when nothing qualifies.
pub(crate) fn select_free_slot(free: u64, np: [u64; CLASS_COUNT], ready: u64, fudge: u32) -> u32 {
    debug_assert!(free != 0);
    let mut fudge = fudge;
    loop {
        let quadrant = 0xFFFFu64 << ((fudge & 0x3) << 4);
        fudge = fudge.wrapping_add(1);
        let start = free & quadrant;
        if start == 0 {
            continue;
        }
        let ideal = start & !np[0] & !np[1] & !ready;
        if ideal != 0 {
            return ideal.trailing_zeros();
        }
        // Overly constrained; relax starting with the map that has the least
        // processing queued in this quadrant.
        let mut val = if (np[0] & quadrant).count_ones() > (np[1] & quadrant).count_ones() {
            let v = start & !np[1];
            if v == 0 { start & !np[0] } else { v }
        } else {
            let v = start & !np[0];
            if v == 0 { start & !np[1] } else { v }
        };
        if val == 0 {
            val = start;
        }
        return val.trailing_zeros();
    }
}

/// Picks a needs-process slot, symmetric to [`select_free_slot`] so that
/// consumers do not collide with producers: the map is divided into eighths
/// and the fudge factor selects which eighth is searched first.
pub(crate) fn select_process_slot(np: u64, fudge: u32) -> u32 {
    debug_assert!(np != 0);
    let mut fudge = fudge;
    loop {
        let chunk = 0xFFu64 << ((fudge & 0x7) << 3);
        fudge = fudge.wrapping_add(1);
        let val = np & chunk;
        if val != 0 {
            return val.trailing_zeros();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_prefers_unloaded_quadrant() {
        // Everything free, nothing queued: the fudge picks the quadrant.
        let slot = select_free_slot(u64::MAX, [0, 0], 0, 1);
        assert!((16..32).contains(&slot));
    }

    #[test]
    fn free_slot_avoids_needs_process() {
        // Quadrant 0, slots 0..4 busy with work: pick the first clean slot.
        let np0 = 0b1111;
        let slot = select_free_slot(u64::MAX, [np0, 0], 0, 0);
        assert_eq!(slot, 4);
    }

    #[test]
    fn free_slot_relaxes_when_constrained() {
        // Only slot 3 free and it needs processing: it must still be chosen.
        let free = 1 << 3;
        let slot = select_free_slot(free, [free, free], free, 0);
        assert_eq!(slot, 3);
    }

    #[test]
    fn process_slot_spreads_by_eighths() {
        let np = (1 << 5) | (1 << 20) | (1 << 50);
        assert_eq!(select_process_slot(np, 0), 5);
        assert_eq!(select_process_slot(np, 2), 20);
        assert_eq!(select_process_slot(np, 6), 50);
        // Empty preferred chunks are skipped.
        assert_eq!(select_process_slot(np, 1), 20);
    }
}
