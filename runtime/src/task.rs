// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Event-driven tasks (EDTs): templates, the dependence frontier, finish
//! scopes and execution.
//!
//! An EDT walks its dependence slots as a frontier: it waits on signaler 0,
//! and only once that slot is satisfied does it register on signaler 1, and
//! so on. A satisfied slot's signaler GUID is overwritten in place by the
//! producing datablock GUID. When the last slot fills, the task is handed to
//! the scheduler exactly once.

use crate::api::EdtContext;
use crate::datablock::AccessMode;
use crate::error::RuntimeError;
use crate::event::{EventKind, LATCH_SLOT_DECR, LATCH_SLOT_INCR};
use crate::guid::{Guid, GuidKind, GuidObject};
use crate::message::{Message, Payload};
use crate::policy::PolicyDomain;
use core::fmt;
use smallvec::SmallVec;
use spin::Mutex;
use std::sync::Arc;

/// Number of EDT-local storage slots.
pub const ELS_SIZE: usize = 8;
/// ELS slot reserved for the enclosing finish latch.
pub const ELS_SLOT_FINISH_LATCH: usize = 0;

/// Signature of user task functions.
///
/// Receives the runtime context, the scalar parameters and one entry per
/// dependence slot. The returned GUID (usually a datablock or `NULL`) is
/// published through the task's output event.
pub type EdtFn = fn(&EdtContext<'_>, &[u64], &[DepItem]) -> Guid;

/// One resolved dependence, as passed to the task function.
#[derive(Debug, Clone, Copy)]
pub struct DepItem {
    /// The producing datablock, or `NULL` for control dependences.
    pub guid: Guid,
    /// Base pointer of the acquired datablock; null for control
    /// dependences.
    pub ptr: *mut u8,
    /// Size of the datablock in bytes.
    pub size: u64,
    pub mode: AccessMode,
}

impl DepItem {
    #[must_use]
    pub fn control() -> Self {
        Self {
            guid: Guid::NULL,
            ptr: core::ptr::null_mut(),
            size: 0,
            mode: AccessMode::Null,
        }
    }
}

bitflags::bitflags! {
    /// Creation properties of an EDT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EdtProps: u32 {
        /// The EDT opens a finish scope: its output event fires only after
        /// all transitively created descendants have completed.
        const FINISH = 1 << 0;
    }
}

/// A task template: the function plus its expected parameter and dependence
/// counts.
#[derive(Debug)]
pub struct EdtTemplate {
    guid: Guid,
    func: EdtFn,
    paramc: u32,
    depc: u32,
}

impl EdtTemplate {
    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    #[must_use]
    pub fn depc(&self) -> u32 {
        self.depc
    }
}

/// One dependence slot of an EDT's signalers array.
///
/// The slot starts as the signaling GUID and is overwritten by the producing
/// datablock GUID upon satisfaction.
#[derive(Debug, Clone, Copy)]
struct SignalerSlot {
    guid: Guid,
    mode: AccessMode,
    /// A dependence has been added for this slot.
    added: bool,
    /// The slot's value is final (the signaler fired or was a datablock).
    satisfied: bool,
    /// A waiter registration for this slot is already in place; the frontier
    /// must not register again.
    registered: bool,
}

impl SignalerSlot {
    fn empty() -> Self {
        Self {
            guid: Guid::UNINITIALIZED,
            mode: AccessMode::default(),
            added: false,
            satisfied: false,
            registered: false,
        }
    }
}

#[derive(Debug)]
struct EdtState {
    signalers: SmallVec<[SignalerSlot; 8]>,
    /// Index of the first unsatisfied slot.
    frontier: u32,
    /// Number of dependences added so far; monotonic, triggers scheduling
    /// exactly once when it reaches `depc`.
    added: u32,
    scheduled: bool,
}

/// Metadata record of an EDT.
pub struct Edt {
    guid: Guid,
    template: Guid,
    func: EdtFn,
    paramv: SmallVec<[u64; 8]>,
    depc: u32,
    output_event: Guid,
    /// The finish latch this EDT owns; `NULL` unless it is a finish EDT.
    finish_latch: Guid,
    /// The enclosing scope's finish latch, inherited from the creator.
    parent_latch: Guid,
    state: Mutex<EdtState>,
    els: Mutex<[u64; ELS_SIZE]>,
}

impl Edt {
    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    #[must_use]
    pub fn output_event(&self) -> Guid {
        self.output_event
    }

    /// The finish latch governing EDTs this task creates: its own latch for
    /// finish EDTs, the inherited one otherwise.
    #[must_use]
    pub(crate) fn scope_latch(&self) -> Guid {
        if self.finish_latch.is_null() {
            self.parent_latch
        } else {
            self.finish_latch
        }
    }

    /// Reads an EDT-local storage slot.
    #[must_use]
    pub fn els_get(&self, offset: usize) -> u64 {
        self.els.lock()[offset]
    }

    /// Writes an EDT-local storage slot. Slot 0 is reserved for the
    /// enclosing finish latch.
    pub fn els_set(&self, offset: usize, value: u64) {
        self.els.lock()[offset] = value;
    }
}

impl fmt::Debug for Edt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edt")
            .field("guid", &self.guid)
            .field("template", &self.template)
            .field("depc", &self.depc)
            .field("output_event", &self.output_event)
            .finish_non_exhaustive()
    }
}

/// What the frontier walk decided to do next, computed under the state lock
/// and executed outside it.
enum FrontierStep {
    /// Register on this signaler and come back.
    Register(Guid, u32),
    /// All slots are filled; hand the task to the scheduler.
    Schedule,
    /// Waiting on an in-flight registration or on further dependence adds.
    Wait,
}

// === task engine ===

impl PolicyDomain {
    /// Creates a task template.
    pub(crate) fn template_create(&self, func: EdtFn, paramc: u32, depc: u32) -> Guid {
        let guid = self.guids().next_guid(GuidKind::Template);
        let template = EdtTemplate {
            guid,
            func,
            paramc,
            depc,
        };
        self.guids()
            .register(guid, GuidObject::Template(Arc::new(template)));
        tracing::debug!(?guid, paramc, depc, "created template");
        guid
    }

    pub(crate) fn template_destroy(&self, guid: Guid) -> Result<(), RuntimeError> {
        if guid.kind() != GuidKind::Template {
            return Err(RuntimeError::InvalidArg);
        }
        self.guids().release(guid)
    }

    /// Creates an EDT from `template`.
    ///
    /// `depv` pre-adds one dependence per non-`UNINITIALIZED` entry; the
    /// remaining slots are added incrementally through `dep_add`. The
    /// creating task (if any) passes itself as `creator` so the new task
    /// inherits the enclosing finish scope.
    ///
    /// Returns the task GUID and its output event (`NULL` unless requested).
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the parameter count does not match the template or
    /// `depv` is longer than the dependence count.
    pub(crate) fn edt_create(
        &self,
        template: Guid,
        paramv: &[u64],
        depv: &[Guid],
        props: EdtProps,
        request_output_event: bool,
        creator: Guid,
    ) -> Result<(Guid, Guid), RuntimeError> {
        let GuidObject::Template(template_rec) = self.deguidify(template)? else {
            return Err(RuntimeError::InvalidGuid);
        };
        if paramv.len() != template_rec.paramc as usize {
            return Err(RuntimeError::InvalidArg);
        }
        let depc = template_rec.depc;
        if depv.len() > depc as usize {
            return Err(RuntimeError::InvalidArg);
        }

        let guid = self.guids().next_guid(GuidKind::Edt);

        // A finish EDT needs an output event for the latch to publish to,
        // whether or not the caller asked for one to be surfaced.
        let output_event = if request_output_event || props.contains(EdtProps::FINISH) {
            self.evt_create(EventKind::Sticky)?
        } else {
            Guid::NULL
        };

        // Inherit the enclosing finish scope from the creator and count
        // ourselves in it.
        let parent_latch = if creator.is_null() {
            Guid::NULL
        } else {
            match self.deguidify(creator)? {
                GuidObject::Edt(creator_rec) => creator_rec.scope_latch(),
                _ => return Err(RuntimeError::InvalidArg),
            }
        };
        if !parent_latch.is_null() {
            self.evt_satisfy(parent_latch, Guid::NULL, LATCH_SLOT_INCR)?;
        }

        // A finish EDT gets its own latch, wired to the parent's and to the
        // output event, pre-incremented for the EDT itself.
        let finish_latch = if props.contains(EdtProps::FINISH) {
            let latch = self.evt_create_finish_latch(guid, parent_latch, output_event)?;
            self.evt_satisfy(latch, Guid::NULL, LATCH_SLOT_INCR)?;
            latch
        } else {
            Guid::NULL
        };

        let record = Edt {
            guid,
            template,
            func: template_rec.func,
            paramv: SmallVec::from_slice(paramv),
            depc,
            output_event,
            finish_latch,
            parent_latch,
            state: Mutex::new(EdtState {
                signalers: (0..depc).map(|_| SignalerSlot::empty()).collect(),
                frontier: 0,
                added: 0,
                scheduled: false,
            }),
            els: Mutex::new([0; ELS_SIZE]),
        };
        let record = Arc::new(record);
        self.guids().register(guid, GuidObject::Edt(Arc::clone(&record)));
        tracing::debug!(?guid, ?template, depc, ?props, "created edt");

        for (slot, dep) in depv.iter().enumerate() {
            if !dep.is_uninitialized() {
                #[expect(clippy::cast_possible_truncation, reason = "depc is u32")]
                let slot = slot as u32;
                self.dep_add(*dep, guid, slot, AccessMode::default())?;
            }
        }
        if depc == 0 {
            self.edt_advance_frontier(&record)?;
        }
        Ok((guid, output_event))
    }

    /// Destroys a task that will never run.
    pub(crate) fn edt_destroy(&self, guid: Guid) -> Result<(), RuntimeError> {
        if guid.kind() != GuidKind::Edt {
            return Err(RuntimeError::InvalidArg);
        }
        self.guids().release(guid)
    }

    /// Records the signaler of a dependence slot.
    ///
    /// `registered` is set when the add-dependence lowering already
    /// registered a waiter on the (non-persistent) signaler, so the frontier
    /// will not register a second time.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on slot overflow or a slot that already has a
    /// dependence.
    pub(crate) fn edt_register_signaler(
        &self,
        dst: Guid,
        signaler: Guid,
        slot: u32,
        mode: AccessMode,
        registered: bool,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve_edt(dst)?;
        {
            let mut state = record.state.lock();
            let depc = record.depc;
            let entry = state
                .signalers
                .get_mut(slot as usize)
                .ok_or(RuntimeError::InvalidArg)?;
            if entry.added {
                return Err(RuntimeError::InvalidArg);
            }
            entry.guid = signaler;
            entry.mode = mode;
            entry.added = true;
            entry.registered = registered;
            // A datablock signaler is already produced; the slot's final
            // value is known.
            entry.satisfied = signaler.kind() == GuidKind::Datablock;
            state.added += 1;
            tracing::trace!(?dst, ?signaler, slot, added = state.added, "registered signaler");
            if state.added < depc {
                return Ok(());
            }
        }
        self.edt_advance_frontier(&record)
    }

    /// Satisfies a dependence slot: the signaler is replaced by the
    /// producing datablock GUID. Fills the slot, and advances the frontier
    /// when the slot is at it.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on out-of-range slots or double satisfaction.
    pub(crate) fn edt_satisfy_slot(
        &self,
        dst: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve_edt(dst)?;
        {
            let mut state = record.state.lock();
            let entry = state
                .signalers
                .get_mut(slot as usize)
                .ok_or(RuntimeError::InvalidArg)?;
            if entry.satisfied {
                return Err(RuntimeError::InvalidArg);
            }
            entry.guid = payload;
            entry.satisfied = true;
            if !entry.added {
                // A pure-control satisfy on a slot nobody registered a
                // signaler for still counts as the slot's dependence.
                entry.added = true;
                state.added += 1;
            }
            tracing::trace!(?dst, slot, ?payload, "satisfied edt slot");
            if state.added < record.depc {
                return Ok(());
            }
        }
        self.edt_advance_frontier(&record)
    }

    /// Walks the dependence frontier, registering on the next unsatisfied
    /// signaler, and hands the task to the scheduler when the last slot is
    /// filled.
    ///
    /// Waiter registration happens outside the state lock: a registration on
    /// an already-satisfied persistent event satisfies us back synchronously.
    fn edt_advance_frontier(&self, record: &Arc<Edt>) -> Result<(), RuntimeError> {
        loop {
            let step = {
                let mut state = record.state.lock();
                if state.scheduled || state.added < record.depc {
                    FrontierStep::Wait
                } else {
                    let mut step = FrontierStep::Schedule;
                    while state.frontier < record.depc {
                        let frontier = state.frontier;
                        let entry = &mut state.signalers[frontier as usize];
                        if entry.satisfied {
                            state.frontier += 1;
                            continue;
                        }
                        if entry.registered {
                            step = FrontierStep::Wait;
                        } else {
                            entry.registered = true;
                            step = FrontierStep::Register(entry.guid, frontier);
                        }
                        break;
                    }
                    if matches!(step, FrontierStep::Schedule) {
                        state.scheduled = true;
                    }
                    step
                }
            };
            match step {
                FrontierStep::Wait => return Ok(()),
                FrontierStep::Schedule => {
                    tracing::debug!(guid = ?record.guid(), "edt ready, scheduling");
                    let mut msg = Message::request(
                        self.location(),
                        self.location(),
                        Payload::EdtSchedule {
                            guid: record.guid(),
                        },
                    );
                    return self.process_message(&mut msg, true);
                }
                FrontierStep::Register(signaler, slot) => {
                    // May satisfy us synchronously (persistent, already
                    // set); the loop re-examines the frontier after.
                    self.evt_register_waiter(signaler, record.guid(), slot)?;
                }
            }
        }
    }

    /// Executes a ready task on the calling worker: acquires the inputs,
    /// runs the user function, releases the inputs, publishes the output and
    /// closes the task's slice of its finish scope.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` for unknown tasks; acquisition failures propagate.
    pub(crate) fn edt_execute(&self, guid: Guid) -> Result<(), RuntimeError> {
        let record = self.resolve_edt(guid)?;

        // The reserved ELS slot carries the enclosing finish latch.
        record.els_set(ELS_SLOT_FINISH_LATCH, record.scope_latch().bits());

        // Materialize the dependence vector, acquiring one datablock per
        // non-control slot. The signalers array is not needed past this
        // point and is freed here.
        let slots: SmallVec<[SignalerSlot; 8]> = {
            let mut state = record.state.lock();
            debug_assert_eq!(state.frontier, record.depc);
            core::mem::take(&mut state.signalers)
        };
        let mut depv: SmallVec<[DepItem; 8]> = SmallVec::new();
        let mut acquired: SmallVec<[Guid; 8]> = SmallVec::new();
        for entry in &slots {
            debug_assert!(entry.satisfied);
            if entry.guid.is_null() || entry.mode == AccessMode::Null {
                depv.push(DepItem::control());
                continue;
            }
            let db = self.resolve_db(entry.guid)?;
            let ptr = db.acquire(guid, entry.mode, false)?;
            acquired.push(entry.guid);
            depv.push(DepItem {
                guid: entry.guid,
                ptr,
                size: db.size(),
                mode: entry.mode,
            });
        }

        tracing::debug!(?guid, deps = depv.len(), "executing edt");
        let ctx = EdtContext::for_edt(self, &record);
        let ret = (record.func)(&ctx, &record.paramv, &depv);

        // Balanced release of everything acquired above. A block the task
        // freed itself mid-run already dropped this hold.
        for db_guid in acquired {
            match self.db_release(db_guid, guid, false) {
                Ok(()) | Err(RuntimeError::Unauthorised | RuntimeError::InvalidGuid) => {}
                Err(err) => return Err(err),
            }
        }

        if !record.finish_latch.is_null() {
            // The latch publishes the return value once the scope drains.
            self.evt_set_return_guid(record.finish_latch, ret)?;
            self.evt_satisfy(record.finish_latch, Guid::NULL, LATCH_SLOT_DECR)?;
        } else {
            if !record.output_event.is_null() {
                self.evt_satisfy(record.output_event, ret, 0)?;
            }
            if !record.parent_latch.is_null() {
                self.evt_satisfy(record.parent_latch, Guid::NULL, LATCH_SLOT_DECR)?;
            }
        }

        self.guids().release(guid)?;
        tracing::debug!(?guid, "edt finished");
        Ok(())
    }

    fn resolve_edt(&self, guid: Guid) -> Result<Arc<Edt>, RuntimeError> {
        match self.deguidify(guid)? {
            GuidObject::Edt(record) => Ok(record),
            _ => Err(RuntimeError::InvalidGuid),
        }
    }
}
