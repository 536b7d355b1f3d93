// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::action::Action;
use crate::event::{EventData, EventRef, MicroEvent, StrandId};
use crate::node::{Summary, TableNode, select_process_slot};
use crate::strand::{Strand, StrandInner, StrandStatus};
use crate::table::StrandTable;
use crate::{
    PROCESS_MAX_COUNT, ProcessProps, Processor, StrandError, StrandTables, WorkClass, WorkerId,
};
use std::sync::Arc;

/// Outcome of resolving an event handle.
#[derive(Debug)]
pub enum Resolution<M> {
    /// The event is ready; the caller now owns it. If it was parked, the
    /// strand has been released (or keeps running if still held).
    Ready(Box<MicroEvent<M>>),
    /// The event is parked and not ready; the caller may enqueue further
    /// actions on the returned strand.
    NotReady(Arc<Strand<M>>),
    /// The value was a direct event that is not ready and not parked; the
    /// caller has to park it before anyone can wait on it.
    NotParked(Box<MicroEvent<M>>),
}

/// Outcome of trying to claim one strand for processing.
enum Claim {
    Ran,
    Retry,
}

impl<M: Send> StrandTables<M> {
    /// Appends actions to a strand, routed to its owning table. See
    /// [`StrandTable::enqueue_actions`].
    ///
    /// # Errors
    ///
    /// Forwards the owning table's errors.
    pub fn enqueue_actions(
        &self,
        worker: WorkerId,
        strand: &Arc<Strand<M>>,
        actions: Vec<Action<M>>,
        clear_fwd_hold: bool,
    ) -> Result<(), StrandError> {
        self.table(strand.id().table)
            .enqueue_actions(worker, strand, actions, clear_fwd_hold)
    }

    /// Marks an event ready through a handle.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on a null handle or an event that is already ready.
    pub fn mark_ready(&self, worker: WorkerId, event: &mut EventRef<M>) -> Result<(), StrandError> {
        match event {
            EventRef::Null => Err(StrandError::InvalidArg),
            EventRef::Ptr(ev) => {
                if ev.is_ready() {
                    return Err(StrandError::InvalidArg);
                }
                ev.mark_ready();
                Ok(())
            }
            EventRef::Parked(id) => self.mark_ready_parked(worker, *id),
        }
    }

    /// Marks the event parked at `id` ready and performs the strand's
    /// readiness transition: `WAIT_EVT` is cleared, and the strand either
    /// surfaces in the needs-process map of its head action's class, surfaces
    /// in the ready map (hold active, no actions), or is released outright.
    ///
    /// Propagation is skipped when the calling worker is the strand's
    /// processing worker; the bookkeeping happens when the run ends.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the event is already ready; `Busy` when the handle
    /// is stale.
    pub fn mark_ready_parked(&self, worker: WorkerId, id: StrandId) -> Result<(), StrandError> {
        let table = self.table(id.table);
        let strand = table.strand_for_index(id.index)?;
        let mut st = strand.lock();
        if st.status.is_free() {
            return Err(StrandError::Busy);
        }
        {
            let Some(event) = st.event.as_deref_mut() else {
                return Err(StrandError::Busy);
            };
            if event.is_ready() {
                return Err(StrandError::InvalidArg);
            }
            event.mark_ready();
        }
        self.ready_transition_locked(worker, table, &strand, &mut st);
        Ok(())
    }

    /// The `WAIT_EVT`-clearing half of [`Self::mark_ready_parked`], shared
    /// with merge completion which already holds the strand lock.
    fn ready_transition_locked(
        &self,
        worker: WorkerId,
        table: &StrandTable<M>,
        strand: &Arc<Strand<M>>,
        st: &mut StrandInner<M>,
    ) {
        debug_assert!(st.status.contains(StrandStatus::WAIT_EVT));
        st.status.remove(StrandStatus::WAIT_EVT);

        if st.processing_worker == Some(worker) {
            tracing::trace!(
                index = strand.index(),
                "skipping propagation, we are the processing worker"
            );
            return;
        }

        let leaf = strand.parent();
        let slot = strand.slot();
        if st.status.contains(StrandStatus::WAIT_ACT) {
            let class = st
                .actions
                .front()
                .map(Action::class)
                .expect("WAIT_ACT with empty action queue");
            let guard = leaf.lock_slots();
            leaf.summary_set_locked(Summary::NeedsProcess(class), slot);
            drop(guard);
            table.note_produced(class);
        } else if st.status.intersects(StrandStatus::HOLD) {
            let guard = leaf.lock_slots();
            leaf.summary_set_locked(Summary::Ready, slot);
            drop(guard);
        } else {
            // Fully ready with no hold: nothing will ever look at this strand
            // again, release it now.
            table.release_locked(strand, st);
        }
    }

    /// Marks the event parked at `id` not-ready again, reversing
    /// [`Self::mark_ready_parked`]. A hold must be active when the strand has
    /// no pending actions, otherwise it would already have been released.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the event is not ready; `Busy` on a stale handle.
    pub fn mark_wait_parked(&self, worker: WorkerId, id: StrandId) -> Result<(), StrandError> {
        let table = self.table(id.table);
        let strand = table.strand_for_index(id.index)?;
        let mut st = strand.lock();
        if st.status.is_free() {
            return Err(StrandError::Busy);
        }
        {
            let Some(event) = st.event.as_deref_mut() else {
                return Err(StrandError::Busy);
            };
            if !event.is_ready() {
                return Err(StrandError::InvalidArg);
            }
            event.mark_not_ready();
        }
        debug_assert!(!st.status.contains(StrandStatus::WAIT_EVT));
        st.status.insert(StrandStatus::WAIT_EVT);

        if st.processing_worker == Some(worker) {
            return Ok(());
        }

        let leaf = strand.parent();
        let slot = strand.slot();
        let guard = leaf.lock_slots();
        if st.status.contains(StrandStatus::WAIT_ACT) {
            let class = st
                .actions
                .front()
                .map(Action::class)
                .expect("WAIT_ACT with empty action queue");
            leaf.summary_clear_locked(Summary::NeedsProcess(class), slot);
            drop(guard);
            table.note_consumed(class);
        } else {
            debug_assert!(st.status.intersects(StrandStatus::HOLD));
            leaf.summary_clear_locked(Summary::Ready, slot);
            drop(guard);
        }
        Ok(())
    }

    /// Resolves an event handle to the event itself if possible.
    ///
    /// `clear_fwd_hold` drops the runtime hold on a successfully resolved
    /// strand, releasing it once no other hold remains. A strand whose event
    /// is ready but which is still held (or still has pending actions) counts
    /// as not ready; clear the hold and resolve again to extract the event.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on a null handle; `Busy` on a stale parked handle.
    pub fn resolve_event(
        &self,
        handle: EventRef<M>,
        clear_fwd_hold: bool,
    ) -> Result<Resolution<M>, StrandError> {
        match handle {
            EventRef::Null => Err(StrandError::InvalidArg),
            EventRef::Ptr(ev) => {
                if ev.is_ready() {
                    Ok(Resolution::Ready(ev))
                } else {
                    Ok(Resolution::NotParked(ev))
                }
            }
            EventRef::Parked(id) => {
                let table = self.table(id.table);
                let strand = table.strand_for_index(id.index)?;
                let mut st = strand.lock();
                if st.status.is_free() {
                    return Err(StrandError::Busy);
                }
                let drained = !st.status.intersects(StrandStatus::WAIT_EVT | StrandStatus::MODIFIED)
                    && st.actions.is_empty()
                    && st.processing_worker.is_none();
                if !drained {
                    drop(st);
                    return Ok(Resolution::NotReady(strand));
                }
                if clear_fwd_hold {
                    st.status.remove(StrandStatus::RHOLD);
                }
                if !st.status.can_release() {
                    drop(st);
                    return Ok(Resolution::NotReady(strand));
                }
                let mut event = st.event.take().ok_or(StrandError::Busy)?;
                event.set_strand(None);
                st.status.remove(StrandStatus::WAIT_ACT);
                table.release_locked(&strand, &mut st);
                Ok(Resolution::Ready(event))
            }
        }
    }

    /// Drains strands whose head action matches `class`, up to
    /// [`PROCESS_MAX_COUNT`] per table (unbounded with
    /// [`ProcessProps::EMPTY_TABLES`]).
    ///
    /// # Errors
    ///
    /// Forwards lookup errors; action failures are re-queued, logged and do
    /// not fail the call.
    pub fn process_strands<P: Processor<Msg = M>>(
        &self,
        proc: &P,
        worker: WorkerId,
        class: WorkClass,
        props: ProcessProps,
    ) -> Result<u32, StrandError> {
        self.process_n_strands(proc, worker, class, PROCESS_MAX_COUNT, props)
    }

    /// Like [`Self::process_strands`] with an explicit per-table strand
    /// count.
    ///
    /// # Errors
    ///
    /// Forwards lookup errors.
    pub fn process_n_strands<P: Processor<Msg = M>>(
        &self,
        proc: &P,
        worker: WorkerId,
        class: WorkClass,
        count: u32,
        props: ProcessProps,
    ) -> Result<u32, StrandError> {
        let mut total = 0;
        // A strand never moves between tables, so both are searched for work
        // of the requested class.
        for table in self.tables() {
            total += self.process_table(table, proc, worker, class, count, props);
        }
        Ok(total)
    }

    fn process_table<P: Processor<Msg = M>>(
        &self,
        table: &StrandTable<M>,
        proc: &P,
        worker: WorkerId,
        class: WorkClass,
        count: u32,
        props: ProcessProps,
    ) -> u32 {
        if table.snapshot_root().is_none() {
            return 0;
        }
        if !props.contains(ProcessProps::EMPTY_TABLES) && !table.consumer_may_enter(class) {
            tracing::trace!(table = ?table.kind(), "limiting contention, not enough work");
            return 0;
        }

        let mut fudge = worker;
        let mut processed = 0u32;
        let mut stale_retries = 0u32;
        'outer: loop {
            if !props.contains(ProcessProps::EMPTY_TABLES) && processed >= count {
                break;
            }
            if stale_retries > 4 * u64::BITS {
                // Summary bits are trailing concurrent claims; let the caller
                // come back rather than spin here.
                break;
            }
            let Some((head, _)) = table.snapshot_root() else {
                break;
            };
            let mut cur = head;
            let mut at_root = true;
            loop {
                let np = cur.needs_process_bits(class);
                if np == 0 {
                    if at_root {
                        break 'outer;
                    }
                    // A sibling consumer beat us to this subtree.
                    fudge = fudge.wrapping_add(1);
                    stale_retries += 1;
                    continue 'outer;
                }
                let slot = select_process_slot(np, fudge);
                if cur.is_leaf() {
                    match self.claim_and_run(table, &cur, slot, proc, worker, class) {
                        Claim::Ran => {
                            processed += 1;
                            stale_retries = 0;
                        }
                        Claim::Retry => {
                            fudge = fudge.wrapping_add(1);
                            stale_retries += 1;
                        }
                    }
                    continue 'outer;
                }
                let child = {
                    let Some(guard) = cur.try_lock_slots() else {
                        fudge = fudge.wrapping_add(1);
                        stale_retries += 1;
                        continue 'outer;
                    };
                    guard.child(slot).map(Arc::clone)
                };
                let Some(child) = child else {
                    // The bit raced ahead of materialization going away.
                    fudge = fudge.wrapping_add(1);
                    stale_retries += 1;
                    continue 'outer;
                };
                cur = child;
                at_root = false;
            }
        }
        processed
    }

    /// Claims the strand at `slot` of `leaf` for `class` work and runs it.
    fn claim_and_run<P: Processor<Msg = M>>(
        &self,
        table: &StrandTable<M>,
        leaf: &Arc<TableNode<M>>,
        slot: u32,
        proc: &P,
        worker: WorkerId,
        class: WorkClass,
    ) -> Claim {
        let Some(guard) = leaf.try_lock_slots() else {
            return Claim::Retry;
        };
        if leaf.needs_process_bits(class) & (1 << slot) == 0 {
            return Claim::Retry;
        }
        let strand = Arc::clone(guard.leaf_strand(slot));
        let Some(mut st) = strand.try_lock() else {
            return Claim::Retry;
        };
        if st.processing_worker.is_some()
            || st.status.contains(StrandStatus::WAIT_EVT)
            || !st.status.contains(StrandStatus::WAIT_ACT)
        {
            return Claim::Retry;
        }
        match st.actions.front().map(Action::class) {
            Some(head_class) if head_class == class => {}
            _ => return Claim::Retry,
        }

        st.processing_worker = Some(worker);
        leaf.summary_clear_locked(Summary::NeedsProcess(class), slot);
        table.note_consumed(class);
        let context = st.context_task;
        drop(st);
        drop(guard);

        tracing::trace!(index = strand.index(), worker, context, "claimed strand for processing");
        self.run_claimed(table, proc, worker, &strand, class);
        Claim::Ran
    }

    /// Runs the claimed strand: pops and executes head actions while the
    /// event stays ready and the head matches `class`, then performs the exit
    /// bookkeeping. The strand lock is *not* held across action execution;
    /// logical ownership is carried by `processing_worker`, so callbacks can
    /// re-enter the tables (including enqueueing on this very strand).
    fn run_claimed<P: Processor<Msg = M>>(
        &self,
        table: &StrandTable<M>,
        proc: &P,
        worker: WorkerId,
        strand: &Arc<Strand<M>>,
        class: WorkClass,
    ) {
        loop {
            let (action, mut event) = {
                let mut st = strand.lock();
                debug_assert_eq!(st.processing_worker, Some(worker));
                if st.status.contains(StrandStatus::WAIT_EVT) {
                    break;
                }
                match st.actions.front().map(Action::class) {
                    Some(head_class) if head_class == class => {}
                    // Actions of another class end the run; the matching
                    // worker type will drain them later.
                    _ => break,
                }
                let action = st.actions.pop_front().expect("head action vanished");
                if st.actions.is_empty() {
                    st.status.remove(StrandStatus::WAIT_ACT);
                }
                (action, st.event.take())
            };

            let result = self.execute_action(proc, worker, &mut event, action);

            let mut st = strand.lock();
            if let Some(event) = event.take() {
                st.event = Some(event);
            }
            if let Err((action, err)) = result {
                // The failed action goes back to the head; the strand is left
                // as-is for retry.
                tracing::warn!(index = strand.index(), %err, "strand action failed, re-queueing");
                st.actions.push_front(action);
                st.status.insert(StrandStatus::WAIT_ACT);
                break;
            }
        }

        self.finish_run(table, worker, strand);
    }

    /// Exit bookkeeping for a processed strand: merge buffered actions, drop
    /// the processing-worker claim and re-publish the strand's state in the
    /// summary maps (or release it).
    fn finish_run(&self, table: &StrandTable<M>, worker: WorkerId, strand: &Arc<Strand<M>>) {
        let mut st = strand.lock();
        debug_assert_eq!(st.processing_worker, Some(worker));

        if st.status.contains(StrandStatus::MODIFIED) {
            let mut buf = strand.buffered();
            st.actions.extend(buf.actions.drain(..));
            if buf.hold_clear {
                st.status.remove(StrandStatus::RHOLD);
                buf.hold_clear = false;
            }
            drop(buf);
            st.status.remove(StrandStatus::MODIFIED);
            tracing::trace!(index = strand.index(), "merged buffered actions");
        }

        st.processing_worker = None;
        if st.actions.is_empty() {
            st.status.remove(StrandStatus::WAIT_ACT);
        } else {
            st.status.insert(StrandStatus::WAIT_ACT);
        }

        let leaf = strand.parent();
        let slot = strand.slot();
        if st.status.contains(StrandStatus::WAIT_EVT) {
            // Waiting on the (new) event again; nothing to publish.
            return;
        }
        if let Some(class) = st.actions.front().map(Action::class) {
            let guard = leaf.lock_slots();
            leaf.summary_set_locked(Summary::NeedsProcess(class), slot);
            drop(guard);
            table.note_produced(class);
        } else if st.status.intersects(StrandStatus::HOLD) {
            let guard = leaf.lock_slots();
            leaf.summary_set_locked(Summary::Ready, slot);
            drop(guard);
        } else {
            table.release_locked(strand, &mut st);
        }
    }

    /// Executes one action. `event` is the strand's current event, taken out
    /// of the strand for the duration of the call; a merge satisfaction
    /// consumes it.
    fn execute_action<P: Processor<Msg = M>>(
        &self,
        proc: &P,
        worker: WorkerId,
        event: &mut Option<Box<MicroEvent<M>>>,
        action: Action<M>,
    ) -> Result<(), (Action<M>, StrandError)> {
        match action {
            Action::ProcessMessage(class) => {
                let Some(ev) = event.as_deref_mut() else {
                    return Err((Action::ProcessMessage(class), StrandError::Busy));
                };
                proc.process_message(worker, ev)
                    .map_err(|err| (Action::ProcessMessage(class), err))
            }
            Action::MarkReady(id) => self
                .mark_ready_parked(worker, id)
                .map_err(|err| (Action::MarkReady(id), err)),
            Action::SatisfyMerge { merge, position } => {
                let Some(ev) = event.take() else {
                    return Err((Action::SatisfyMerge { merge, position }, StrandError::Busy));
                };
                match self.satisfy_merge(worker, merge, position, EventRef::Ptr(ev)) {
                    Ok(()) => Ok(()),
                    Err((returned, err)) => {
                        if let EventRef::Ptr(ev) = returned {
                            *event = Some(ev);
                        }
                        Err((Action::SatisfyMerge { merge, position }, err))
                    }
                }
            }
            Action::ProcessEvent { continuation } => {
                let Some(ev) = event.as_deref_mut() else {
                    return Err((Action::ProcessEvent { continuation }, StrandError::Busy));
                };
                proc.process_event(worker, ev, continuation)
                    .map_err(|err| (Action::ProcessEvent { continuation }, err))
            }
            Action::Continuation(cont) => {
                let Some(ev) = event.as_deref_mut() else {
                    return Err((Action::Continuation(cont), StrandError::Busy));
                };
                match (cont.callback)(ev, cont.target_jump) {
                    Ok(()) => Ok(()),
                    Err(err) => Err((Action::Continuation(cont), err)),
                }
            }
        }
    }

    /// Installs `sub` into slot `position` of the merge event parked at
    /// `merge`, marking the merge ready when the last sub-event lands.
    fn satisfy_merge(
        &self,
        worker: WorkerId,
        merge: StrandId,
        position: u32,
        sub: EventRef<M>,
    ) -> Result<(), (EventRef<M>, StrandError)> {
        let table = self.table(merge.table);
        let strand = match table.strand_for_index(merge.index) {
            Ok(strand) => strand,
            Err(err) => return Err((sub, err)),
        };
        let mut st = strand.lock();
        let complete = {
            let Some(event) = st.event.as_deref_mut() else {
                return Err((sub, StrandError::Busy));
            };
            let EventData::Merge(merge_ev) = &mut event.data else {
                return Err((sub, StrandError::InvalidArg));
            };
            if position >= merge_ev.count() {
                return Err((sub, StrandError::InvalidArg));
            }
            merge_ev.install(position, sub)
        };
        if complete {
            let event = st.event.as_deref_mut().expect("merge event vanished");
            event.mark_ready();
            self.ready_transition_locked(worker, table, &strand, &mut st);
        }
        Ok(())
    }

    /// Blocks the caller until every listed event resolves, executing other
    /// strands in between attempts.
    ///
    /// Per round, each still-parked event's own strand is stolen if its head
    /// action matches `class`; between rounds an exponentially growing batch
    /// of unrelated strands is processed. Progress relies on at least one
    /// worker of the right class being available for each class.
    ///
    /// Resolved entries are replaced in place with the ready event.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when an entry is a non-parked, non-ready event (nothing
    /// can ever resolve it).
    pub fn process_resolve_events<P: Processor<Msg = M>>(
        &self,
        proc: &P,
        worker: WorkerId,
        events: &mut [EventRef<M>],
        class: WorkClass,
        clear_fwd_hold: bool,
    ) -> Result<(), StrandError> {
        let mut batch = 1u32;
        loop {
            let mut unresolved = 0u32;
            for entry in events.iter_mut() {
                match entry {
                    EventRef::Null => continue,
                    EventRef::Ptr(ev) if ev.is_ready() => continue,
                    EventRef::Ptr(_) => return Err(StrandError::InvalidArg),
                    EventRef::Parked(_) => {}
                }
                let handle = core::mem::replace(entry, EventRef::Null);
                match self.resolve_event(handle, clear_fwd_hold)? {
                    Resolution::Ready(ev) => *entry = EventRef::Ptr(ev),
                    Resolution::NotParked(_) => return Err(StrandError::InvalidArg),
                    Resolution::NotReady(strand) => {
                        *entry = EventRef::Parked(strand.id());
                        unresolved += 1;
                        // Steal the strand's own work if it matches our class.
                        let table = self.table(strand.id().table);
                        let leaf = strand.parent();
                        let _ = self.claim_and_run(table, &leaf, strand.slot(), proc, worker, class);
                    }
                }
            }
            if unresolved == 0 {
                return Ok(());
            }
            self.process_n_strands(proc, worker, class, batch, ProcessProps::empty())?;
            batch = (batch * 2).min(PROCESS_MAX_COUNT);
        }
    }

    /// Drains both tables completely, regardless of class. Used on the
    /// teardown path before [`Self::reset`].
    ///
    /// # Errors
    ///
    /// Forwards processing errors.
    pub fn drain<P: Processor<Msg = M>>(
        &self,
        proc: &P,
        worker: WorkerId,
    ) -> Result<(), StrandError> {
        loop {
            let work = self.process_n_strands(
                proc,
                worker,
                WorkClass::Work,
                u32::MAX,
                ProcessProps::EMPTY_TABLES,
            )?;
            let comm = self.process_n_strands(
                proc,
                worker,
                WorkClass::Comm,
                u32::MAX,
                ProcessProps::EMPTY_TABLES,
            )?;
            if work == 0 && comm == 0 {
                return Ok(());
            }
        }
    }

    /// Drops both trees. All strands must have been drained and released.
    pub fn reset(&self) {
        for table in self.tables() {
            table.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventData, MergeEvent};
    use crate::{StrandTableConfig, TableKind};
    use core::sync::atomic::{AtomicU32, Ordering};
    use spin::Mutex;

    #[derive(Default)]
    struct TestProcessor {
        messages: AtomicU32,
        continuations: Mutex<Vec<u32>>,
    }

    impl Processor for TestProcessor {
        type Msg = u32;

        fn process_message(
            &self,
            _worker: WorkerId,
            event: &mut MicroEvent<u32>,
        ) -> Result<(), StrandError> {
            assert!(matches!(event.data, EventData::Msg(_)));
            self.messages.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn process_event(
            &self,
            _worker: WorkerId,
            _event: &mut MicroEvent<u32>,
            continuation: u32,
        ) -> Result<(), StrandError> {
            self.continuations.lock().push(continuation);
            Ok(())
        }
    }

    fn tables() -> StrandTables<u32> {
        StrandTables::new(StrandTableConfig::default())
    }

    #[test]
    fn ready_message_is_processed() {
        let tables = tables();
        let proc = TestProcessor::default();
        let event = Box::new(MicroEvent::new_msg(7u32));
        let strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, event, StrandStatus::empty())
            .unwrap();
        tables
            .enqueue_actions(0, &strand, vec![Action::ProcessMessage(WorkClass::Work)], true)
            .unwrap();

        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(proc.messages.load(Ordering::Relaxed), 1);
        // Fully drained and unheld: the strand went back to the free pool.
        assert!(strand.status().is_free());
    }

    #[test]
    fn actions_run_in_enqueue_order_after_mark_ready() {
        let tables = tables();
        let proc = TestProcessor::default();
        let event = Box::new(MicroEvent::new(EventData::Fct { continuation: 0 }));
        let strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, event, StrandStatus::empty())
            .unwrap();
        let actions = (0..10)
            .map(|i| Action::ProcessEvent { continuation: i })
            .collect::<Vec<_>>();
        tables.enqueue_actions(0, &strand, actions, true).unwrap();

        // Not ready yet: nothing runs.
        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 0);

        tables.mark_ready_parked(0, strand.id()).unwrap();
        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(*proc.continuations.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn comm_actions_wait_for_comm_workers() {
        let tables = tables();
        let proc = TestProcessor::default();
        let event = Box::new(MicroEvent::new_msg(1u32));
        let strand = tables
            .table(TableKind::Comm)
            .get_new_strand(0, event, StrandStatus::empty())
            .unwrap();
        tables
            .enqueue_actions(0, &strand, vec![Action::ProcessMessage(WorkClass::Comm)], true)
            .unwrap();

        // A compute pass must not touch communication work.
        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 0);
        let n = tables
            .process_strands(&proc, 0, WorkClass::Comm, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(proc.messages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn resolve_extracts_final_event() {
        let tables = tables();
        let event = Box::new(MicroEvent::new(EventData::CommStatus(42)));
        let strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, event, StrandStatus::empty())
            .unwrap();
        let handle = EventRef::<u32>::Parked(strand.id());

        match tables.resolve_event(handle, false).unwrap() {
            Resolution::NotReady(s) => assert_eq!(s.id(), strand.id()),
            other => panic!("unexpected resolution {other:?}"),
        }

        tables.mark_ready_parked(0, strand.id()).unwrap();
        match tables
            .resolve_event(EventRef::Parked(strand.id()), true)
            .unwrap()
        {
            Resolution::Ready(ev) => {
                assert!(matches!(ev.data, EventData::CommStatus(42)));
            }
            other => panic!("unexpected resolution {other:?}"),
        }
        assert!(strand.status().is_free());
    }

    #[test]
    fn merge_fires_after_all_slots() {
        let tables = tables();
        let proc = TestProcessor::default();

        let merge = Box::new(MicroEvent::new(EventData::Merge(MergeEvent::new(2))));
        let merge_strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, merge, StrandStatus::UHOLD)
            .unwrap();

        for position in 0..2u32 {
            let sub = Box::new(MicroEvent::new(EventData::Control));
            let strand = tables
                .table(TableKind::Event)
                .get_new_strand(0, sub, StrandStatus::empty())
                .unwrap();
            tables
                .enqueue_actions(
                    0,
                    &strand,
                    vec![Action::SatisfyMerge {
                        merge: merge_strand.id(),
                        position,
                    }],
                    true,
                )
                .unwrap();
            tables.mark_ready_parked(0, strand.id()).unwrap();
        }

        tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();

        match tables
            .resolve_event(EventRef::<u32>::Parked(merge_strand.id()), true)
            .unwrap()
        {
            Resolution::Ready(ev) => match ev.data {
                EventData::Merge(mut m) => {
                    assert_eq!(m.count_ready(), 2);
                    assert_eq!(m.take_slots().len(), 2);
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected resolution {other:?}"),
        }
    }

    #[test]
    fn process_resolve_events_blocks_until_ready() {
        let tables = tables();
        let proc = TestProcessor::default();

        // One strand whose head action marks the other strand's event ready.
        let target = Box::new(MicroEvent::new(EventData::Control));
        let target_strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, target, StrandStatus::empty())
            .unwrap();

        let trigger = Box::new(MicroEvent::new_ready(EventData::Control));
        let trigger_strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, trigger, StrandStatus::empty())
            .unwrap();
        tables
            .enqueue_actions(
                0,
                &trigger_strand,
                vec![Action::MarkReady(target_strand.id())],
                true,
            )
            .unwrap();

        let mut events = [EventRef::<u32>::Parked(target_strand.id())];
        tables
            .process_resolve_events(&proc, 0, &mut events, WorkClass::Work, true)
            .unwrap();
        assert!(matches!(&events[0], EventRef::Ptr(ev) if ev.is_ready()));
    }

    #[test]
    fn contention_limit_admits_only_produced_work() {
        let tables = StrandTables::<u32>::new(StrandTableConfig {
            contention_limit: true,
        });
        let proc = TestProcessor::default();

        let strand = tables
            .table(TableKind::Event)
            .get_new_strand(0, Box::new(MicroEvent::new_msg(5)), StrandStatus::empty())
            .unwrap();
        tables
            .enqueue_actions(0, &strand, vec![Action::ProcessMessage(WorkClass::Work)], true)
            .unwrap();

        // The produced unit admits one consumer pass.
        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 1);
        // With the counter drained, idle consumers stay out entirely.
        let n = tables
            .process_strands(&proc, 0, WorkClass::Work, ProcessProps::empty())
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(proc.messages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_tables_drains_everything() {
        let tables = tables();
        let proc = TestProcessor::default();
        for i in 0..100u32 {
            let table = if i % 2 == 0 {
                TableKind::Event
            } else {
                TableKind::Comm
            };
            let class = if i % 3 == 0 {
                WorkClass::Comm
            } else {
                WorkClass::Work
            };
            let strand = tables
                .table(table)
                .get_new_strand(i, Box::new(MicroEvent::new_msg(i)), StrandStatus::empty())
                .unwrap();
            tables
                .enqueue_actions(i, &strand, vec![Action::ProcessMessage(class)], true)
                .unwrap();
        }
        tables.drain(&proc, 0).unwrap();
        assert_eq!(proc.messages.load(Ordering::Relaxed), 100);

        // Every slot is back in the free pool and the summary bitmaps agree
        // with a linear scan.
        for table in tables.tables() {
            let (head, _) = table.snapshot_root().unwrap();
            assert!(crate::table::subtree_is_free(&head));
        }
        tables.reset();
    }
}
