// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::action::Action;
use crate::event::{MicroEvent, StrandId};
use crate::node::TableNode;
use crate::{NODE_SIZE_LOG2, TableKind, WorkerId};
use spin::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

bitflags::bitflags! {
    /// Status bits of a strand slot.
    ///
    /// A slot with no bits set is free. A strand may be released back to the
    /// free pool only when no `WAIT_*` bit and no hold bit is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StrandStatus: u32 {
        /// The slot is occupied and its event is not ready.
        const WAIT_EVT = 1 << 0;
        /// The slot is occupied and has actions pending.
        const WAIT_ACT = 1 << 1;
        /// The user holds the slot open.
        const UHOLD = 1 << 4;
        /// The runtime holds the slot open (a forward reference to the
        /// strand's final event exists somewhere).
        const RHOLD = 1 << 5;
        /// Actions were buffered while another worker was processing the
        /// strand; they must be merged when the run ends.
        const MODIFIED = 1 << 6;
    }
}

impl StrandStatus {
    /// Either wait bit.
    pub const WAIT: StrandStatus = StrandStatus::WAIT_EVT.union(StrandStatus::WAIT_ACT);
    /// Either hold bit.
    pub const HOLD: StrandStatus = StrandStatus::UHOLD.union(StrandStatus::RHOLD);

    #[inline]
    #[must_use]
    pub fn is_free(self) -> bool {
        self.is_empty()
    }

    /// True when the strand can be returned to the free pool.
    #[inline]
    #[must_use]
    pub fn can_release(self) -> bool {
        !self.intersects(StrandStatus::WAIT.union(StrandStatus::HOLD))
    }
}

/// A strand: a serialized chain of deferred actions anchored to one event.
///
/// Strands are preallocated with their leaf node and reused; "allocating" a
/// strand flips its slot's free bit and initializes [`StrandInner`].
#[derive(Debug)]
pub struct Strand<M> {
    table: TableKind,
    index: u64,
    parent: Weak<TableNode<M>>,
    inner: Mutex<StrandInner<M>>,
    buffered: Mutex<BufferedActions<M>>,
    /// Extra buffer for strands of the communication table, for a
    /// communication backend to use.
    comm_buffer: Option<Mutex<Vec<u8>>>,
}

/// Mutable state of a strand, guarded by the strand lock.
///
/// Lock order: the strand lock comes before its parent node's lock, which
/// comes before the grandparent's, ascending. Never the reverse.
#[derive(Debug)]
pub(crate) struct StrandInner<M> {
    pub status: StrandStatus,
    /// Event currently pointed to by this slot.
    pub event: Option<Box<MicroEvent<M>>>,
    /// Deque of actions to perform once the event is ready.
    pub actions: VecDeque<Action<M>>,
    /// Worker currently draining this strand, if any. While set, other
    /// workers must buffer enqueues instead of touching `actions`.
    pub processing_worker: Option<WorkerId>,
    /// Task that was live when the strand was created; restored around
    /// action processing. Opaque to this crate.
    pub context_task: u64,
}

/// Actions buffered by non-holders while a strand is being processed,
/// guarded by its own lock so enqueuers never contend with the processor.
#[derive(Debug)]
pub(crate) struct BufferedActions<M> {
    pub actions: VecDeque<Action<M>>,
    /// True if merging the buffered actions should also clear the runtime
    /// hold.
    pub hold_clear: bool,
}

impl<M> Strand<M> {
    pub(crate) fn new_free(table: TableKind, index: u64, parent: Weak<TableNode<M>>) -> Self {
        Self {
            table,
            index,
            parent,
            inner: Mutex::new(StrandInner {
                status: StrandStatus::empty(),
                event: None,
                actions: VecDeque::new(),
                processing_worker: None,
                context_task: 0,
            }),
            buffered: Mutex::new(BufferedActions {
                actions: VecDeque::new(),
                hold_clear: false,
            }),
            comm_buffer: (table == TableKind::Comm).then(|| Mutex::new(Vec::new())),
        }
    }

    /// The stable address of this strand.
    #[inline]
    #[must_use]
    pub fn id(&self) -> StrandId {
        StrandId {
            table: self.table,
            index: self.index,
        }
    }

    /// Index of this strand within its table.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Slot position within the parent leaf node.
    #[inline]
    pub(crate) fn slot(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 6 bits")]
        let slot = (self.index & ((1 << NODE_SIZE_LOG2) - 1)) as u32;
        slot
    }

    pub(crate) fn parent(&self) -> Arc<TableNode<M>> {
        self.parent
            .upgrade()
            .expect("strand outlived its table node")
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StrandInner<M>> {
        self.inner.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, StrandInner<M>>> {
        self.inner.try_lock()
    }

    pub(crate) fn buffered(&self) -> MutexGuard<'_, BufferedActions<M>> {
        self.buffered.lock()
    }

    /// Current status bits. Requires the strand lock only for a consistent
    /// snapshot; this convenience takes it briefly.
    #[must_use]
    pub fn status(&self) -> StrandStatus {
        self.inner.lock().status
    }

    /// The communication buffer, present only on strands of the
    /// communication table.
    #[must_use]
    pub fn comm_buffer(&self) -> Option<&Mutex<Vec<u8>>> {
        self.comm_buffer.as_ref()
    }

    /// The task that was live when the strand was claimed; opaque to this
    /// crate, restored by the processor around action runs.
    #[must_use]
    pub fn context_task(&self) -> u64 {
        self.inner.lock().context_task
    }

    /// Records the claiming task's identity on the strand.
    pub fn set_context_task(&self, task: u64) {
        self.inner.lock().context_task = task;
    }

    /// Clears the user hold. The strand is released by the next processing
    /// pass (or immediately by the caller via the owning table) once it is
    /// fully drained.
    pub fn clear_user_hold(&self) {
        self.inner.lock().status.remove(StrandStatus::UHOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_requires_no_wait_and_no_hold() {
        assert!(StrandStatus::empty().can_release());
        assert!(!(StrandStatus::WAIT_EVT).can_release());
        assert!(!(StrandStatus::WAIT_ACT).can_release());
        assert!(!(StrandStatus::UHOLD).can_release());
        assert!(!(StrandStatus::RHOLD).can_release());
        assert!(StrandStatus::MODIFIED.can_release());
    }
}
