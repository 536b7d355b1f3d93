// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{MERGE_SIZE, TableKind};
use core::fmt;

/// A micro-event: the unit a strand waits on and the value it produces.
///
/// A micro-event is essentially ready or non-ready and optionally carries a
/// payload. If an event is not ready and someone needs it to be, a slot from
/// one of the strand tables is grabbed and the event is parked there; the
/// resulting [`StrandId`] then stands in for the event in handles that cross
/// the runtime (see [`EventRef`]).
#[derive(Debug)]
pub struct MicroEvent<M> {
    props: EventProps,
    strand: Option<StrandId>,
    /// Variant-specific payload.
    pub data: EventData<M>,
}

bitflags::bitflags! {
    /// Property bits of a micro-event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventProps: u32 {
        /// The event is ready. Events are created non-ready.
        const READY = 1 << 0;
        /// The event should be garbage collected when the strand holding it
        /// is released.
        const GC = 1 << 1;
        /// Destroying this event also destroys structures it points to.
        const DESTROY_DEEP = 1 << 2;
    }
}

/// Variant payload of a [`MicroEvent`].
#[derive(Debug)]
pub enum EventData<M> {
    /// A pure control event; readiness is the only information.
    Control,
    /// A communication status word.
    CommStatus(u32),
    /// A policy message to be fed to the dispatcher.
    Msg(MsgEvent<M>),
    /// A continuation callback context for the `processEvent` entry point.
    Fct {
        /// Continuation id passed back to the processor.
        continuation: u32,
    },
    /// A merge of several events; ready only once all sub-events are ready.
    Merge(MergeEvent<M>),
}

/// Payload of a message-bearing micro-event.
#[derive(Debug)]
pub struct MsgEvent<M> {
    /// The message; the "arguments" when handed to the dispatcher.
    pub msg: M,
    /// Continuation id cached from the strand, if any.
    pub continuation: Option<u32>,
}

/// Payload of a merge micro-event.
#[derive(Debug)]
pub struct MergeEvent<M> {
    count: u32,
    count_ready: u32,
    slots: Vec<Option<EventRef<M>>>,
}

impl<M> MergeEvent<M> {
    /// Creates a merge over `count` sub-events, all initially unresolved.
    #[must_use]
    pub fn new(count: u32) -> Self {
        let mut slots = Vec::with_capacity((count as usize).max(MERGE_SIZE));
        slots.resize_with(count as usize, || None);
        Self {
            count,
            count_ready: 0,
            slots,
        }
    }

    /// Number of sub-events.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of sub-events that have become ready.
    #[inline]
    #[must_use]
    pub fn count_ready(&self) -> u32 {
        self.count_ready
    }

    /// Installs a ready sub-event at `position`. Returns `true` when this was
    /// the last outstanding sub-event.
    pub(crate) fn install(&mut self, position: u32, event: EventRef<M>) -> bool {
        let slot = &mut self.slots[position as usize];
        debug_assert!(slot.is_none(), "merge slot {position} satisfied twice");
        *slot = Some(event);
        self.count_ready += 1;
        self.count_ready == self.count
    }

    /// Takes the resolved sub-events out of the merge.
    pub fn take_slots(&mut self) -> Vec<Option<EventRef<M>>> {
        core::mem::take(&mut self.slots)
    }
}

impl<M> MicroEvent<M> {
    /// Creates a non-ready event with the given payload.
    #[must_use]
    pub fn new(data: EventData<M>) -> Self {
        Self {
            props: EventProps::empty(),
            strand: None,
            data,
        }
    }

    /// Creates an already-ready event with the given payload.
    #[must_use]
    pub fn new_ready(data: EventData<M>) -> Self {
        Self {
            props: EventProps::READY,
            strand: None,
            data,
        }
    }

    /// Creates a ready message event, the common case for dispatch-later
    /// work.
    #[must_use]
    pub fn new_msg(msg: M) -> Self {
        Self::new_ready(EventData::Msg(MsgEvent {
            msg,
            continuation: None,
        }))
    }

    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.props.contains(EventProps::READY)
    }

    #[inline]
    #[must_use]
    pub fn props(&self) -> EventProps {
        self.props
    }

    /// Sets property bits (for example [`EventProps::GC`]).
    pub fn set_props(&mut self, props: EventProps) {
        self.props.insert(props);
    }

    pub(crate) fn mark_ready(&mut self) {
        self.props.insert(EventProps::READY);
    }

    pub(crate) fn mark_not_ready(&mut self) {
        self.props.remove(EventProps::READY);
    }

    /// The strand currently holding this event, if it is parked.
    #[inline]
    #[must_use]
    pub fn strand(&self) -> Option<StrandId> {
        self.strand
    }

    pub(crate) fn set_strand(&mut self, strand: Option<StrandId>) {
        self.strand = strand;
    }
}

/// A handle to a micro-event: either the event itself or the strand it is
/// parked in.
///
/// On the wire this is a single 64-bit word whose low three bits are zero for
/// a null handle and carry the table tag for a parked event; see
/// [`StrandId::encode`]. In memory the distinction is carried by the type.
/// The parked form lets a producer publish a handle that tracks the *final*
/// event of a strand even as intermediate events are consumed and destroyed
/// during processing.
#[derive(Debug)]
pub enum EventRef<M> {
    /// No event.
    Null,
    /// The event itself, owned.
    Ptr(Box<MicroEvent<M>>),
    /// The event is parked in a strand table.
    Parked(StrandId),
}

impl<M> EventRef<M> {
    /// Encodes the handle to its 64-bit wire form. Only null and parked
    /// handles have a wire form; owned events must be parked first.
    #[must_use]
    pub fn encode(&self) -> Option<u64> {
        match self {
            EventRef::Null => Some(0),
            EventRef::Parked(id) => Some(id.encode()),
            EventRef::Ptr(_) => None,
        }
    }

    /// Decodes a 64-bit wire handle. Zero decodes to [`EventRef::Null`];
    /// an unassigned table tag is an error.
    pub fn decode(bits: u64) -> Result<Self, crate::StrandError> {
        if bits == 0 {
            return Ok(EventRef::Null);
        }
        match StrandId::decode(bits) {
            Some(id) => Ok(EventRef::Parked(id)),
            None => Err(crate::StrandError::InvalidArg),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EventRef::Null)
    }
}

/// The stable address of a strand: its table and index within that table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrandId {
    pub table: TableKind,
    pub index: u64,
}

impl StrandId {
    /// Encodes to the wire form: index shifted left by three, table tag in
    /// the low bits.
    #[inline]
    #[must_use]
    pub fn encode(self) -> u64 {
        (self.index << 3) | self.table as u64
    }

    /// Decodes the wire form; `None` when the low bits carry no table tag.
    #[inline]
    #[must_use]
    pub fn decode(bits: u64) -> Option<Self> {
        let table = TableKind::from_tag(bits & 0b111)?;
        Some(Self {
            table,
            index: bits >> 3,
        })
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.table, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strand_id_round_trip() {
        for table in [TableKind::Event, TableKind::Comm] {
            for index in [0u64, 1, 63, 64, 4095, 1 << 40] {
                let id = StrandId { table, index };
                assert_eq!(StrandId::decode(id.encode()), Some(id));
            }
        }
    }

    #[test]
    fn null_and_bad_tags() {
        assert!(EventRef::<()>::decode(0).unwrap().is_null());
        // Tag 0b011 is unassigned.
        assert!(EventRef::<()>::decode(0b011).is_err());
        // Tag 0b000 with a non-zero index would be a raw pointer; the enum
        // form never encodes those, so decoding treats it as invalid.
        assert!(EventRef::<()>::decode(1 << 3).is_err());
    }

    #[test]
    fn merge_completion() {
        let mut merge = MergeEvent::<()>::new(2);
        assert!(!merge.install(1, EventRef::Null));
        assert!(merge.install(0, EventRef::Null));
        assert_eq!(merge.count_ready(), 2);
    }
}
