// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! GUID handles and the per-domain provider mapping handles to metadata.
//!
//! A GUID is an opaque 64-bit value whose bits encode the object kind, the
//! home location of the object and a per-provider counter. The encoding is
//! opaque to everything except this module.

use crate::datablock::Datablock;
use crate::error::RuntimeError;
use crate::event::EventRecord;
use crate::task::{Edt, EdtTemplate};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hashbrown::HashMap;
use mycelium_bitfield::bitfield;
use spin::RwLock;
use std::sync::Arc;

/// Identifies a policy domain within the platform.
pub type Location = u32;

bitfield! {
    /// Packed bit layout of a GUID handle.
    struct GuidBits<u64> {
        /// Object kind discriminant.
        const KIND = 6;
        /// Home location of the object.
        const LOCATION = 16;
        /// Monotonic per-provider counter.
        const COUNTER = ..;
    }
}

/// The kind of runtime object a GUID refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuidKind {
    None = 0,
    Datablock = 1,
    EventOnce = 2,
    EventSticky = 3,
    EventIdem = 4,
    EventLatch = 5,
    EventFinishLatch = 6,
    EventChannel = 7,
    Edt = 8,
    Template = 9,
    Policy = 10,
}

impl GuidKind {
    #[must_use]
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Datablock),
            2 => Some(Self::EventOnce),
            3 => Some(Self::EventSticky),
            4 => Some(Self::EventIdem),
            5 => Some(Self::EventLatch),
            6 => Some(Self::EventFinishLatch),
            7 => Some(Self::EventChannel),
            8 => Some(Self::Edt),
            9 => Some(Self::Template),
            10 => Some(Self::Policy),
            _ => None,
        }
    }

    /// Whether this kind is one of the event kinds.
    #[must_use]
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::EventOnce
                | Self::EventSticky
                | Self::EventIdem
                | Self::EventLatch
                | Self::EventFinishLatch
                | Self::EventChannel
        )
    }
}

// Every kind discriminant must fit the KIND field.
static_assertions::const_assert!((GuidKind::Policy as u64) < (1 << 6));

/// An opaque handle to a runtime object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(u64);

impl Guid {
    /// The null handle.
    pub const NULL: Guid = Guid(0);
    /// Sentinel for a dependence slot whose signaler has not been provided
    /// yet.
    pub const UNINITIALIZED: Guid = Guid(u64::MAX);

    #[must_use]
    pub(crate) fn pack(kind: GuidKind, location: Location, counter: u64) -> Self {
        let bits = GuidBits::new()
            .with(GuidBits::KIND, kind as u64)
            .with(GuidBits::LOCATION, u64::from(location))
            .with(GuidBits::COUNTER, counter);
        Guid(bits.0)
    }

    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        Guid(bits)
    }

    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn is_uninitialized(self) -> bool {
        self == Self::UNINITIALIZED
    }

    /// The object kind encoded in the handle; [`GuidKind::None`] for null,
    /// uninitialized and foreign values.
    #[must_use]
    pub fn kind(self) -> GuidKind {
        if self.is_null() || self.is_uninitialized() {
            return GuidKind::None;
        }
        GuidKind::from_bits(GuidBits::from_bits(self.0).get(GuidBits::KIND))
            .unwrap_or(GuidKind::None)
    }

    /// The home location encoded in the handle.
    #[must_use]
    pub fn location(self) -> Location {
        #[expect(clippy::cast_possible_truncation, reason = "field is 16 bits wide")]
        let location = GuidBits::from_bits(self.0).get(GuidBits::LOCATION) as Location;
        location
    }

    #[must_use]
    pub fn counter(self) -> u64 {
        GuidBits::from_bits(self.0).get(GuidBits::COUNTER)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Guid(NULL)")
        } else if self.is_uninitialized() {
            f.write_str("Guid(UNINIT)")
        } else {
            write!(
                f,
                "Guid({:?}@{}#{})",
                self.kind(),
                self.location(),
                self.counter()
            )
        }
    }
}

/// Strongly typed reference to the metadata behind a GUID.
#[derive(Debug, Clone)]
pub enum GuidObject {
    Event(Arc<EventRecord>),
    Datablock(Arc<Datablock>),
    Edt(Arc<Edt>),
    Template(Arc<EdtTemplate>),
    Policy(Location),
}

bitflags::bitflags! {
    /// Properties of a labeled GUID creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LabeledProps: u32 {
        /// The caller supplies the GUID instead of the runtime generating
        /// one.
        const IS_LABELED = 1 << 0;
        /// Atomic try-insert: a collision surfaces `AlreadyExists` and the
        /// existing metadata.
        const CHECK = 1 << 1;
        /// Retry until the insert wins; for creators that own the label by
        /// construction.
        const BLOCK = 1 << 2;
    }
}

struct GuidSlot {
    obj: GuidObject,
    /// Cleared while a labeled creation is still initializing its metadata;
    /// readers spin until the owner publishes. Mirrors writing the GUID's own
    /// value as the first metadata word once initialization completes.
    init: AtomicBool,
}

/// The per-policy-domain GUID service: maps handles to metadata and hands
/// out fresh handles and reservations.
pub struct GuidProvider {
    location: Location,
    counter: AtomicU64,
    map: RwLock<HashMap<u64, Arc<GuidSlot>>>,
}

impl GuidProvider {
    #[must_use]
    pub fn new(location: Location) -> Self {
        Self {
            location,
            // Counter zero would collide with the null handle.
            counter: AtomicU64::new(1),
            map: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    /// Allocates a fresh handle of `kind` without registering metadata.
    pub fn next_guid(&self, kind: GuidKind) -> Guid {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        Guid::pack(kind, self.location, counter)
    }

    /// Allocates a handle and registers `obj` behind it.
    pub fn guidify(&self, kind: GuidKind, obj: GuidObject) -> Guid {
        let guid = self.next_guid(kind);
        self.register(guid, obj);
        guid
    }

    /// Registers `obj` behind an already-allocated handle.
    pub fn register(&self, guid: Guid, obj: GuidObject) {
        self.map.write().insert(
            guid.bits(),
            Arc::new(GuidSlot {
                obj,
                init: AtomicBool::new(true),
            }),
        );
        tracing::trace!(?guid, "guidified");
    }

    /// Registers metadata behind a caller-supplied (labeled) handle.
    ///
    /// With [`LabeledProps::CHECK`] a collision fails with `AlreadyExists`;
    /// with [`LabeledProps::BLOCK`] the call retries until the insert wins;
    /// with neither the insert is unconditional ("trust me" mode). The entry
    /// is registered unpublished; the owner must call [`Self::publish`] once
    /// the metadata is fully initialized.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when the handle's home location is not this provider;
    /// `AlreadyExists` on a `CHECK` collision.
    pub fn register_labeled(
        &self,
        guid: Guid,
        obj: GuidObject,
        props: LabeledProps,
    ) -> Result<(), RuntimeError> {
        if guid.location() != self.location {
            return Err(RuntimeError::InvalidArg);
        }
        let slot = Arc::new(GuidSlot {
            obj,
            init: AtomicBool::new(false),
        });
        loop {
            {
                let mut map = self.map.write();
                if props.contains(LabeledProps::CHECK) {
                    if map.contains_key(&guid.bits()) {
                        return Err(RuntimeError::AlreadyExists);
                    }
                    map.insert(guid.bits(), slot);
                    return Ok(());
                }
                if props.contains(LabeledProps::BLOCK) {
                    if !map.contains_key(&guid.bits()) {
                        map.insert(guid.bits(), slot);
                        return Ok(());
                    }
                    // Fall through and retry once the current owner releases.
                } else {
                    map.insert(guid.bits(), slot);
                    return Ok(());
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Marks a labeled entry fully initialized, releasing concurrent
    /// readers spinning in [`Self::deguidify`].
    pub fn publish(&self, guid: Guid) {
        let map = self.map.read();
        if let Some(slot) = map.get(&guid.bits()) {
            slot.init.store(true, Ordering::Release);
        }
    }

    /// Resolves a handle to its metadata. Spins while a labeled entry is
    /// still being initialized by its owner.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` when the handle does not resolve.
    pub fn deguidify(&self, guid: Guid) -> Result<GuidObject, RuntimeError> {
        let slot = {
            let map = self.map.read();
            map.get(&guid.bits()).cloned()
        }
        .ok_or(RuntimeError::InvalidGuid)?;
        while !slot.init.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        Ok(slot.obj.clone())
    }

    /// Releases a handle, dropping the registry's reference to the
    /// metadata.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` when the handle is not registered here.
    pub fn release(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.map
            .write()
            .remove(&guid.bits())
            .map(|_| ())
            .ok_or(RuntimeError::InvalidGuid)
    }

    /// Pre-reserves a contiguous range of `count` handles of `kind`.
    /// Reservations are monotonic; there is no reclaim.
    pub fn reserve(&self, count: u64, kind: GuidKind) -> (Guid, u64) {
        let start = self.counter.fetch_add(count, Ordering::Relaxed);
        (Guid::pack(kind, self.location, start), 1)
    }

    /// Number of registered handles; drops to zero at clean shutdown.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.map.read().len()
    }
}

impl fmt::Debug for GuidProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidProvider")
            .field("location", &self.location)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let guid = Guid::pack(GuidKind::EventSticky, 7, 99);
        assert_eq!(guid.kind(), GuidKind::EventSticky);
        assert_eq!(guid.location(), 7);
        assert_eq!(guid.counter(), 99);
    }

    #[test]
    fn null_and_uninitialized_are_kindless() {
        assert_eq!(Guid::NULL.kind(), GuidKind::None);
        assert_eq!(Guid::UNINITIALIZED.kind(), GuidKind::None);
        assert!(Guid::NULL.is_null());
        assert!(Guid::UNINITIALIZED.is_uninitialized());
    }

    #[test]
    fn guidify_deguidify_bijection() {
        let provider = GuidProvider::new(3);
        let guid = provider.guidify(GuidKind::Policy, GuidObject::Policy(3));
        match provider.deguidify(guid).unwrap() {
            GuidObject::Policy(loc) => assert_eq!(loc, 3),
            other => panic!("wrong object {other:?}"),
        }
        provider.release(guid).unwrap();
        assert_eq!(
            provider.deguidify(guid).unwrap_err(),
            RuntimeError::InvalidGuid
        );
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn labeled_check_collides() {
        let provider = GuidProvider::new(0);
        let (start, stride) = provider.reserve(4, GuidKind::Policy);
        assert_eq!(stride, 1);
        let label = Guid::pack(GuidKind::Policy, 0, start.counter() + stride);

        provider
            .register_labeled(label, GuidObject::Policy(0), LabeledProps::CHECK)
            .unwrap();
        provider.publish(label);
        assert_eq!(
            provider
                .register_labeled(label, GuidObject::Policy(0), LabeledProps::CHECK)
                .unwrap_err(),
            RuntimeError::AlreadyExists
        );
        assert!(provider.deguidify(label).is_ok());
    }

    #[test]
    fn reservations_are_monotonic() {
        let provider = GuidProvider::new(0);
        let (a, _) = provider.reserve(16, GuidKind::Edt);
        let (b, _) = provider.reserve(16, GuidKind::Edt);
        assert!(b.counter() >= a.counter() + 16);
    }
}
