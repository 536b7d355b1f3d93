// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User-visible events and the dependency engine.
//!
//! Every event owns a *waiters datablock*: a runtime-internal datablock
//! holding a growable array of `(waiter, slot)` records. The list grows by
//! atomic replacement (allocate double, copy, free the old block) and is
//! poisoned (`waiters_count == -1`) while a persistent satisfy fans out, so
//! that late registrations take the already-satisfied path instead of
//! appending to a list nobody will read again.

use crate::error::RuntimeError;
use crate::guid::{Guid, GuidKind, GuidObject};
use crate::message::{Message, Payload};
use crate::policy::PolicyDomain;
use core::fmt;
use spin::Mutex;
use std::collections::VecDeque;

/// Latch slot performing a decrement.
pub const LATCH_SLOT_DECR: u32 = 0;
/// Latch slot performing an increment.
pub const LATCH_SLOT_INCR: u32 = 1;

/// Size of one packed `(waiter, slot)` record in a waiters datablock.
const WAITER_RECORD_SIZE: usize = 12;

/// Behavioral variant of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Satisfied exactly once; self-destroys on satisfy.
    Once,
    /// Single payload, monotonic; a second satisfy is an error.
    Sticky,
    /// Like sticky but extra satisfies are dropped silently.
    Idem,
    /// Signed counter with increment/decrement slots; fires at zero.
    Latch,
    /// Runtime-internal latch tracking a finish scope.
    FinishLatch,
    /// Bounded FIFO of payloads.
    Channel,
}

impl EventKind {
    /// Persistent events survive their satisfy and keep answering
    /// registrations.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Sticky | Self::Idem | Self::Channel)
    }

    #[must_use]
    pub fn guid_kind(self) -> GuidKind {
        match self {
            Self::Once => GuidKind::EventOnce,
            Self::Sticky => GuidKind::EventSticky,
            Self::Idem => GuidKind::EventIdem,
            Self::Latch => GuidKind::EventLatch,
            Self::FinishLatch => GuidKind::EventFinishLatch,
            Self::Channel => GuidKind::EventChannel,
        }
    }

    #[must_use]
    pub fn from_guid_kind(kind: GuidKind) -> Option<Self> {
        match kind {
            GuidKind::EventOnce => Some(Self::Once),
            GuidKind::EventSticky => Some(Self::Sticky),
            GuidKind::EventIdem => Some(Self::Idem),
            GuidKind::EventLatch => Some(Self::Latch),
            GuidKind::EventFinishLatch => Some(Self::FinishLatch),
            GuidKind::EventChannel => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Kind-specific payload of an event.
#[derive(Debug)]
pub(crate) enum EventPayload {
    /// Once/sticky/idem: the single datablock payload, `UNINITIALIZED`
    /// until satisfied.
    Value(Guid),
    Latch {
        counter: i64,
    },
    Finish(FinishPayload),
    Channel {
        queue: VecDeque<Guid>,
    },
}

/// Extra state of a finish latch: back-edges to the scope's plumbing, stored
/// as GUIDs rather than owning pointers.
#[derive(Debug, Clone)]
pub(crate) struct FinishPayload {
    pub counter: i64,
    /// The finish EDT owning this latch.
    #[expect(dead_code, reason = "kept for diagnostics of finish scopes")]
    pub owner: Guid,
    /// Enclosing finish latch to decrement when this one fires.
    pub parent_latch: Guid,
    /// Output event satisfied with `return_guid` when this latch fires.
    pub output_event: Guid,
    /// Stashed by the owner EDT at completion.
    pub return_guid: Guid,
}

#[derive(Debug)]
pub(crate) struct EventInner {
    payload: EventPayload,
    waiters_db: Guid,
    /// Number of registered waiters; -1 poisons registration during a
    /// persistent satisfy fan-out.
    waiters_count: i32,
    waiters_max: u32,
    destroyed: bool,
}

/// Metadata record of a user event.
pub struct EventRecord {
    guid: Guid,
    kind: EventKind,
    inner: Mutex<EventInner>,
}

impl EventRecord {
    fn new(guid: Guid, kind: EventKind, waiters_db: Guid, waiters_max: u32) -> Self {
        let payload = match kind {
            EventKind::Once | EventKind::Sticky | EventKind::Idem => {
                EventPayload::Value(Guid::UNINITIALIZED)
            }
            EventKind::Latch => EventPayload::Latch { counter: 0 },
            EventKind::FinishLatch => EventPayload::Finish(FinishPayload {
                counter: 0,
                owner: Guid::NULL,
                parent_latch: Guid::NULL,
                output_event: Guid::NULL,
                return_guid: Guid::NULL,
            }),
            EventKind::Channel => EventPayload::Channel {
                queue: VecDeque::new(),
            },
        };
        Self {
            guid,
            kind,
            inner: Mutex::new(EventInner {
                payload,
                waiters_db,
                waiters_count: 0,
                waiters_max,
                destroyed: false,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Number of currently registered waiters; for teardown accounting.
    #[must_use]
    pub fn waiter_count(&self) -> i32 {
        self.inner.lock().waiters_count
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn write_waiter(bytes: &mut [u8], idx: usize, waiter: Guid, slot: u32) {
    let off = idx * WAITER_RECORD_SIZE;
    bytes[off..off + 8].copy_from_slice(&waiter.bits().to_le_bytes());
    bytes[off + 8..off + 12].copy_from_slice(&slot.to_le_bytes());
}

fn read_waiter(bytes: &[u8], idx: usize) -> (Guid, u32) {
    let off = idx * WAITER_RECORD_SIZE;
    let mut guid = [0u8; 8];
    guid.copy_from_slice(&bytes[off..off + 8]);
    let mut slot = [0u8; 4];
    slot.copy_from_slice(&bytes[off + 8..off + 12]);
    (Guid::from_bits(u64::from_le_bytes(guid)), u32::from_le_bytes(slot))
}

// === event engine ===

impl PolicyDomain {
    /// Builds the metadata record and waiters datablock for an event living
    /// at `guid`.
    fn evt_build_record(&self, guid: Guid, kind: EventKind) -> Result<EventRecord, RuntimeError> {
        let capacity = self.config().event.init_waiter_count;
        let waiters_db =
            self.db_create_internal(guid, u64::from(capacity) * WAITER_RECORD_SIZE as u64)?;
        Ok(EventRecord::new(guid, kind, waiters_db, capacity))
    }

    /// Creates an event of `kind` with an initial waiters datablock.
    ///
    /// # Errors
    ///
    /// `NoMemory` when the waiters datablock cannot be allocated.
    pub(crate) fn evt_create(&self, kind: EventKind) -> Result<Guid, RuntimeError> {
        let guid = self.guids().next_guid(kind.guid_kind());
        let record = self.evt_build_record(guid, kind)?;
        self.guids()
            .register(guid, GuidObject::Event(std::sync::Arc::new(record)));
        tracing::debug!(?guid, ?kind, "created event");
        Ok(guid)
    }

    /// Creates an event under a caller-supplied labeled GUID. The dispatcher
    /// routes these requests to the label's home domain first.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the label does not belong here or its kind does not
    /// match; `AlreadyExists` on a `CHECK` collision.
    pub(crate) fn evt_create_labeled(
        &self,
        kind: EventKind,
        label: Guid,
        props: crate::guid::LabeledProps,
    ) -> Result<Guid, RuntimeError> {
        if label.location() != self.location() || label.kind() != kind.guid_kind() {
            return Err(RuntimeError::InvalidArg);
        }
        let record = self.evt_build_record(label, kind)?;
        let waiters_db = record.inner.lock().waiters_db;
        if let Err(err) = self.guids().register_labeled(
            label,
            GuidObject::Event(std::sync::Arc::new(record)),
            props,
        ) {
            // Collision: give the waiters datablock back before surfacing
            // the existing metadata to the caller.
            self.db_free_internal(label, waiters_db)?;
            return Err(err);
        }
        self.guids().publish(label);
        tracing::debug!(?label, ?kind, "created labeled event");
        Ok(label)
    }

    /// Creates the finish latch for a finish scope, wired to the enclosing
    /// latch and the scope's output event.
    pub(crate) fn evt_create_finish_latch(
        &self,
        owner: Guid,
        parent_latch: Guid,
        output_event: Guid,
    ) -> Result<Guid, RuntimeError> {
        let guid = self.evt_create(EventKind::FinishLatch)?;
        let record = self.resolve_event(guid)?;
        let mut inner = record.inner.lock();
        if let EventPayload::Finish(finish) = &mut inner.payload {
            finish.owner = owner;
            finish.parent_latch = parent_latch;
            finish.output_event = output_event;
        }
        Ok(guid)
    }

    /// Stashes the return GUID a finish latch publishes to its output event
    /// when it fires.
    pub(crate) fn evt_set_return_guid(
        &self,
        latch: Guid,
        return_guid: Guid,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve_event(latch)?;
        let mut inner = record.inner.lock();
        match &mut inner.payload {
            EventPayload::Finish(finish) => {
                finish.return_guid = return_guid;
                Ok(())
            }
            _ => Err(RuntimeError::InvalidArg),
        }
    }

    /// Destroys an event explicitly. Only the owning policy domain may do
    /// this; the dispatcher routes non-local requests before they get here.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for non-local GUIDs, `InvalidGuid` for unknown ones.
    pub(crate) fn evt_destroy(&self, guid: Guid) -> Result<(), RuntimeError> {
        if guid.location() != self.location() {
            return Err(RuntimeError::InvalidArg);
        }
        let record = self.resolve_event(guid)?;
        let waiters_db = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            inner.destroyed = true;
            core::mem::replace(&mut inner.waiters_db, Guid::NULL)
        };
        self.destroy_event_storage(guid, waiters_db)
    }

    /// Frees the waiters datablock, then the metadata, then the GUID.
    fn destroy_event_storage(&self, guid: Guid, waiters_db: Guid) -> Result<(), RuntimeError> {
        if !waiters_db.is_null() {
            self.db_free_internal(guid, waiters_db)?;
        }
        self.guids().release(guid)?;
        tracing::debug!(?guid, "destroyed event");
        Ok(())
    }

    /// Satisfies `guid` with `payload` on `slot`; kind dispatched.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` on destroyed events, `DuplicateSatisfy` on a second
    /// sticky satisfy, `InvalidArg` for bad slots.
    pub(crate) fn evt_satisfy(
        &self,
        guid: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve_event(guid)?;
        match record.kind() {
            EventKind::Once => self.satisfy_once(&record, payload),
            EventKind::Sticky | EventKind::Idem => self.satisfy_persistent(&record, payload),
            EventKind::Latch => self.satisfy_latch(&record, payload, slot),
            EventKind::FinishLatch => self.satisfy_finish_latch(&record, payload, slot),
            EventKind::Channel => self.satisfy_channel(&record, payload),
        }
    }

    fn satisfy_once(&self, record: &EventRecord, payload: Guid) -> Result<(), RuntimeError> {
        let guid = record.guid();
        let (waiters, waiters_db) = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            inner.destroyed = true;
            let waiters = self.collect_waiters(&inner)?;
            (waiters, core::mem::replace(&mut inner.waiters_db, Guid::NULL))
        };
        tracing::trace!(?guid, waiters = waiters.len(), "once event satisfied");
        for (waiter, slot) in waiters {
            self.post_satisfy(guid, waiter, payload, slot);
        }
        // A satisfied once event transitions to destroyed in the same
        // critical section in which its waiters were snapshotted.
        self.destroy_event_storage(guid, waiters_db)
    }

    fn satisfy_persistent(&self, record: &EventRecord, payload: Guid) -> Result<(), RuntimeError> {
        let guid = record.guid();
        let waiters = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            match &mut inner.payload {
                EventPayload::Value(value) => {
                    if !value.is_uninitialized() {
                        return if record.kind() == EventKind::Idem {
                            // Idempotent events drop extra satisfies on the
                            // floor.
                            tracing::trace!(?guid, "idempotent satisfy dropped");
                            Ok(())
                        } else {
                            Err(RuntimeError::DuplicateSatisfy)
                        };
                    }
                    *value = payload;
                }
                _ => return Err(RuntimeError::InvalidArg),
            }
            let waiters = self.collect_waiters(&inner)?;
            // Poison so no further registration interleaves with the
            // notification sweep; late registrants take the already-set
            // path.
            inner.waiters_count = -1;
            waiters
        };
        tracing::trace!(?guid, waiters = waiters.len(), "persistent event satisfied");
        for (waiter, slot) in waiters {
            self.post_satisfy(guid, waiter, payload, slot);
        }
        Ok(())
    }

    fn satisfy_latch(
        &self,
        record: &EventRecord,
        payload: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        let delta = match slot {
            LATCH_SLOT_DECR => -1i64,
            LATCH_SLOT_INCR => 1i64,
            _ => return Err(RuntimeError::InvalidArg),
        };
        let guid = record.guid();
        let (waiters, waiters_db) = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            let EventPayload::Latch { counter } = &mut inner.payload else {
                return Err(RuntimeError::InvalidArg);
            };
            *counter += delta;
            tracing::trace!(?guid, counter = *counter, "latch satisfied");
            if *counter != 0 {
                return Ok(());
            }
            inner.destroyed = true;
            let waiters = self.collect_waiters(&inner)?;
            (waiters, core::mem::replace(&mut inner.waiters_db, Guid::NULL))
        };
        for (waiter, wslot) in waiters {
            self.post_satisfy(guid, waiter, payload, wslot);
        }
        self.destroy_event_storage(guid, waiters_db)
    }

    fn satisfy_finish_latch(
        &self,
        record: &EventRecord,
        payload: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        let delta = match slot {
            LATCH_SLOT_DECR => -1i64,
            LATCH_SLOT_INCR => 1i64,
            _ => return Err(RuntimeError::InvalidArg),
        };
        let guid = record.guid();
        let (waiters, waiters_db, finish) = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            let EventPayload::Finish(finish) = &mut inner.payload else {
                return Err(RuntimeError::InvalidArg);
            };
            finish.counter += delta;
            tracing::trace!(?guid, counter = finish.counter, "finish latch satisfied");
            if finish.counter != 0 {
                return Ok(());
            }
            let finish = finish.clone();
            inner.destroyed = true;
            let waiters = self.collect_waiters(&inner)?;
            (
                waiters,
                core::mem::replace(&mut inner.waiters_db, Guid::NULL),
                finish,
            )
        };
        for (waiter, wslot) in waiters {
            self.post_satisfy(guid, waiter, payload, wslot);
        }
        self.destroy_event_storage(guid, waiters_db)?;

        // The finish scope is complete: publish the owner's return value and
        // close the enclosing scope.
        if !finish.output_event.is_null() {
            self.evt_satisfy(finish.output_event, finish.return_guid, 0)?;
        }
        if !finish.parent_latch.is_null() {
            self.evt_satisfy(finish.parent_latch, Guid::NULL, LATCH_SLOT_DECR)?;
        }
        Ok(())
    }

    fn satisfy_channel(&self, record: &EventRecord, payload: Guid) -> Result<(), RuntimeError> {
        let guid = record.guid();
        let next_waiter = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            if inner.waiters_count > 0 {
                let waiter = self.take_first_waiter(&mut inner)?;
                Some(waiter)
            } else {
                let capacity = self.config().event.channel_capacity;
                let EventPayload::Channel { queue } = &mut inner.payload else {
                    return Err(RuntimeError::InvalidArg);
                };
                if queue.len() >= capacity {
                    return Err(RuntimeError::NoMemory);
                }
                queue.push_back(payload);
                None
            }
        };
        if let Some((waiter, slot)) = next_waiter {
            self.post_satisfy(guid, waiter, payload, slot);
        }
        Ok(())
    }

    /// Records the event-to-waiter edge. If the event is already satisfied
    /// and persistent, the registration degenerates into a direct satisfy of
    /// the registering waiter.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` after the event was destroyed; `NoMemory` when the
    /// waiter list hit its configured cap.
    pub(crate) fn evt_register_waiter(
        &self,
        event: Guid,
        waiter: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        let record = self.resolve_event(event)?;
        enum Immediate {
            Registered,
            Satisfy(Guid),
        }
        let outcome = {
            let mut inner = record.inner.lock();
            if inner.destroyed {
                return Err(RuntimeError::InvalidGuid);
            }
            match &mut inner.payload {
                EventPayload::Value(value)
                    if record.kind().is_persistent() && !value.is_uninitialized() =>
                {
                    // Covers the poisoned window too: the payload is
                    // installed before the count is poisoned.
                    Immediate::Satisfy(*value)
                }
                EventPayload::Channel { queue } if !queue.is_empty() => {
                    let payload = queue.pop_front().expect("checked non-empty");
                    Immediate::Satisfy(payload)
                }
                _ => {
                    self.append_waiter(event, &mut inner, waiter, slot)?;
                    Immediate::Registered
                }
            }
        };
        match outcome {
            Immediate::Registered => {
                tracing::trace!(?event, ?waiter, slot, "registered waiter");
                Ok(())
            }
            Immediate::Satisfy(payload) => {
                // Already satisfied: notify synchronously instead of
                // inserting into the list.
                tracing::trace!(?event, ?waiter, slot, "registration on satisfied event");
                let mut msg = Message::request(
                    self.location(),
                    waiter.location(),
                    Payload::DepSatisfy {
                        satisfier: event,
                        dst: waiter,
                        payload,
                        slot,
                    },
                );
                self.process_message(&mut msg, true)
            }
        }
    }

    /// Records the signaler-to-destination edge. Events do not track their
    /// signalers; a task destination records the slot's signaler and access
    /// mode.
    pub(crate) fn evt_register_signaler(
        &self,
        dst: Guid,
        signaler: Guid,
        slot: u32,
        mode: crate::datablock::AccessMode,
        push_registered: bool,
    ) -> Result<(), RuntimeError> {
        match dst.kind() {
            GuidKind::Edt => self.edt_register_signaler(dst, signaler, slot, mode, push_registered),
            kind if kind.is_event() => {
                tracing::trace!(?dst, ?signaler, slot, "signaler edge on event recorded");
                Ok(())
            }
            _ => Err(RuntimeError::InvalidArg),
        }
    }

    /// Returns the event's current payload, or `UNINITIALIZED` when it has
    /// not been satisfied yet (or the kind carries no single payload).
    pub(crate) fn evt_get(&self, guid: Guid) -> Result<Guid, RuntimeError> {
        let record = self.resolve_event(guid)?;
        let inner = record.inner.lock();
        if inner.destroyed {
            return Err(RuntimeError::InvalidGuid);
        }
        Ok(match &inner.payload {
            EventPayload::Value(value) => *value,
            EventPayload::Channel { queue } => {
                queue.front().copied().unwrap_or(Guid::UNINITIALIZED)
            }
            EventPayload::Latch { .. } | EventPayload::Finish(_) => Guid::UNINITIALIZED,
        })
    }

    /// Lowers an add-dependence request into the primitive operations.
    ///
    /// The rewrite for non-persistent sources performs the signaler
    /// registration before the waiter registration, so that a racing once
    /// satisfy never reads freed metadata.
    pub(crate) fn dep_add(
        &self,
        src: Guid,
        dst: Guid,
        slot: u32,
        mode: crate::datablock::AccessMode,
    ) -> Result<(), RuntimeError> {
        if src.is_null() {
            // Pure control dependence: immediately satisfied with no
            // payload.
            let mut msg = Message::request(
                self.location(),
                dst.location(),
                Payload::DepSatisfy {
                    satisfier: Guid::NULL,
                    dst,
                    payload: Guid::NULL,
                    slot,
                },
            );
            return self.process_message(&mut msg, true);
        }
        match src.kind() {
            GuidKind::Datablock => match dst.kind() {
                // A datablock source is, by definition, already produced.
                kind if kind.is_event() => self.evt_satisfy(dst, src, slot),
                // The signaler registration records the access mode and the
                // slot counts as satisfied right away.
                GuidKind::Edt => self.evt_register_signaler(dst, src, slot, mode, false),
                _ => Err(RuntimeError::InvalidArg),
            },
            kind if kind.is_event() => {
                let src_kind =
                    EventKind::from_guid_kind(kind).expect("event kind checked above");
                match dst.kind() {
                    GuidKind::Edt => {
                        let push = !src_kind.is_persistent();
                        self.evt_register_signaler(dst, src, slot, mode, push)?;
                        if push {
                            // Non-persistent source: register eagerly, the
                            // event may fire (and free itself) at any time.
                            self.evt_register_waiter(src, dst, slot)?;
                        }
                        Ok(())
                    }
                    dk if dk.is_event() => self.evt_register_waiter(src, dst, slot),
                    _ => Err(RuntimeError::InvalidArg),
                }
            }
            _ => Err(RuntimeError::InvalidArg),
        }
    }

    // --- waiter list plumbing ---

    fn collect_waiters(&self, inner: &EventInner) -> Result<Vec<(Guid, u32)>, RuntimeError> {
        if inner.waiters_count <= 0 {
            return Ok(Vec::new());
        }
        #[expect(clippy::cast_sign_loss, reason = "checked positive above")]
        let count = inner.waiters_count as usize;
        let db = self.resolve_db(inner.waiters_db)?;
        Ok(db.with_bytes(|bytes| (0..count).map(|i| read_waiter(bytes, i)).collect()))
    }

    fn take_first_waiter(&self, inner: &mut EventInner) -> Result<(Guid, u32), RuntimeError> {
        debug_assert!(inner.waiters_count > 0);
        #[expect(clippy::cast_sign_loss, reason = "positive by contract")]
        let count = inner.waiters_count as usize;
        let db = self.resolve_db(inner.waiters_db)?;
        let first = db.with_bytes(|bytes| {
            let first = read_waiter(bytes, 0);
            // Shift the remaining records down; FIFO order matters for
            // channels.
            for i in 1..count {
                let (guid, slot) = read_waiter(bytes, i);
                write_waiter(bytes, i - 1, guid, slot);
            }
            first
        });
        inner.waiters_count -= 1;
        Ok(first)
    }

    fn append_waiter(
        &self,
        event: Guid,
        inner: &mut EventInner,
        waiter: Guid,
        slot: u32,
    ) -> Result<(), RuntimeError> {
        debug_assert!(inner.waiters_count >= 0);
        #[expect(clippy::cast_sign_loss, reason = "checked non-negative")]
        let count = inner.waiters_count as u32;
        if count + 1 == inner.waiters_max {
            let new_max = inner.waiters_max * 2;
            if let Some(cap) = self.config().event.max_waiters {
                if new_max > cap {
                    return Err(RuntimeError::NoMemory);
                }
            }
            // Grow by atomic replacement: allocate double, copy, install,
            // free the old block.
            let old_db = self.resolve_db(inner.waiters_db)?;
            let new_guid =
                self.db_create_internal(event, u64::from(new_max) * WAITER_RECORD_SIZE as u64)?;
            let new_db = self.resolve_db(new_guid)?;
            old_db.with_bytes(|old_bytes| {
                new_db.with_bytes(|new_bytes| {
                    let len = count as usize * WAITER_RECORD_SIZE;
                    new_bytes[..len].copy_from_slice(&old_bytes[..len]);
                });
            });
            self.db_free_internal(event, inner.waiters_db)?;
            inner.waiters_db = new_guid;
            inner.waiters_max = new_max;
            tracing::trace!(new_max, "grew waiter list");
        }
        let db = self.resolve_db(inner.waiters_db)?;
        db.with_bytes(|bytes| write_waiter(bytes, count as usize, waiter, slot));
        inner.waiters_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_record_round_trip() {
        let mut bytes = vec![0u8; WAITER_RECORD_SIZE * 4];
        let guid = Guid::from_bits(0xDEAD_BEEF_0042);
        write_waiter(&mut bytes, 2, guid, 7);
        assert_eq!(read_waiter(&bytes, 2), (guid, 7));
        assert_eq!(read_waiter(&bytes, 0), (Guid::NULL, 0));
    }

    #[test]
    fn kind_mappings() {
        for kind in [
            EventKind::Once,
            EventKind::Sticky,
            EventKind::Idem,
            EventKind::Latch,
            EventKind::FinishLatch,
            EventKind::Channel,
        ] {
            assert_eq!(EventKind::from_guid_kind(kind.guid_kind()), Some(kind));
        }
        assert!(EventKind::Sticky.is_persistent());
        assert!(!EventKind::Once.is_persistent());
        assert!(!EventKind::Latch.is_persistent());
    }
}
