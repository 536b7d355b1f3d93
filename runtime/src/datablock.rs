// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Datablocks: runtime-managed contiguous memory regions, addressable only
//! through the acquire/release protocol.

use crate::error::RuntimeError;
use crate::guid::Guid;
use arrayvec::ArrayVec;
use core::cell::UnsafeCell;
use core::fmt;
use spin::Mutex;

/// Maximum number of concurrent acquirers tracked per datablock.
pub const MAX_DB_USERS: usize = 64;

/// Access mode of a dependence or acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Read only.
    Ro,
    /// Read write; the default mode.
    #[default]
    Rw,
    /// Exclusive write. Reserved; acquisition requests are rejected.
    Ew,
    /// Constant.
    Const,
    /// Pure control dependence; no datablock is attached.
    Null,
}

bitflags::bitflags! {
    /// Creation-time properties of a datablock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Do not acquire the block for the creating task.
        const NO_ACQUIRE = 1 << 0;
        /// Runtime-internal block (waiter lists and similar); not counted as
        /// a user acquisition.
        const INTERNAL = 1 << 1;
    }
}

/// One tracked acquirer.
#[derive(Debug, Clone, Copy)]
struct DbUser {
    edt: Guid,
    #[expect(dead_code, reason = "recorded for diagnostics, not enforced")]
    mode: AccessMode,
    internal: bool,
}

#[derive(Debug)]
struct DbState {
    num_users: u32,
    internal_users: u32,
    free_requested: bool,
    destroyed: bool,
    tracker: ArrayVec<DbUser, MAX_DB_USERS>,
}

/// A contiguous byte region with slotted acquirer tracking and deferred
/// free.
///
/// The region is destroyed when the user count and the internal count are
/// both zero and a free has been requested.
pub struct Datablock {
    guid: Guid,
    size: u64,
    flags: DbFlags,
    state: Mutex<DbState>,
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: the byte region is handed out as raw pointers whose lifetimes are
// bounded by the acquire/release protocol under `state`; the runtime never
// dereferences the region itself. Concurrent access through the pointers is
// governed by the access-mode contract between tasks, exactly like the
// region of any shared-memory allocation.
unsafe impl Send for Datablock {}
// Safety: see above.
unsafe impl Sync for Datablock {}

impl Datablock {
    #[must_use]
    pub fn new(guid: Guid, size: u64, flags: DbFlags) -> Self {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "allocation sizes are host usize"
        )]
        let len = size as usize;
        Self {
            guid,
            size,
            flags,
            state: Mutex::new(DbState {
                num_users: 0,
                internal_users: 0,
                free_requested: false,
                destroyed: false,
                tracker: ArrayVec::new(),
            }),
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> DbFlags {
        self.flags
    }

    fn base_ptr(&self) -> *mut u8 {
        // Safety: only the address is taken here; dereferencing is governed
        // by the acquisition protocol.
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Records `edt` as an acquirer and returns the region's base pointer.
    ///
    /// Re-acquiring by the same task is idempotent and returns the existing
    /// pointer without touching the counts.
    ///
    /// # Errors
    ///
    /// `NotSupported` for the reserved EW mode, `Unauthorised` once a free
    /// has been requested, `Busy` when the tracker is full.
    pub fn acquire(
        &self,
        edt: Guid,
        mode: AccessMode,
        internal: bool,
    ) -> Result<*mut u8, RuntimeError> {
        if mode == AccessMode::Ew {
            return Err(RuntimeError::NotSupported);
        }
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::InvalidGuid);
        }
        if state.free_requested {
            return Err(RuntimeError::Unauthorised);
        }
        if state
            .tracker
            .iter()
            .any(|user| user.edt == edt && user.internal == internal)
        {
            return Ok(self.base_ptr());
        }
        if state.tracker.is_full() {
            return Err(RuntimeError::Busy);
        }
        state.tracker.push(DbUser {
            edt,
            mode,
            internal,
        });
        if internal {
            state.internal_users += 1;
        } else {
            state.num_users += 1;
        }
        tracing::trace!(
            guid = ?self.guid,
            ?edt,
            internal,
            users = state.num_users,
            internal_users = state.internal_users,
            "acquired datablock"
        );
        Ok(self.base_ptr())
    }

    /// Drops `edt`'s acquisition. Returns `true` when this release destroyed
    /// the block (all counts zero with a pending free); the caller must then
    /// unregister the GUID.
    ///
    /// # Errors
    ///
    /// `Unauthorised` when a non-internal release finds no matching
    /// acquisition. A spurious internal release is tolerated.
    pub fn release(&self, edt: Guid, internal: bool) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::InvalidGuid);
        }
        let pos = state
            .tracker
            .iter()
            .position(|user| user.edt == edt && user.internal == internal);
        match pos {
            Some(pos) => {
                let user = state.tracker.swap_remove(pos);
                if user.internal {
                    state.internal_users -= 1;
                } else {
                    state.num_users -= 1;
                }
            }
            None if internal => {
                // Re-release by the runtime is tolerated.
                state.internal_users = state.internal_users.saturating_sub(1);
            }
            None => return Err(RuntimeError::Unauthorised),
        }
        tracing::trace!(
            guid = ?self.guid,
            ?edt,
            internal,
            users = state.num_users,
            internal_users = state.internal_users,
            "released datablock"
        );
        Ok(self.maybe_destroy(&mut state))
    }

    /// Requests destruction. If `edt` currently holds the block the request
    /// also releases that hold. The physical free is deferred until the last
    /// outstanding acquisition is released.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` when the block is already destroyed.
    pub fn request_free(&self, edt: Guid) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::InvalidGuid);
        }
        state.free_requested = true;
        if let Some(pos) = state.tracker.iter().position(|user| user.edt == edt) {
            let user = state.tracker.swap_remove(pos);
            if user.internal {
                state.internal_users -= 1;
            } else {
                state.num_users -= 1;
            }
        }
        tracing::trace!(guid = ?self.guid, ?edt, "free requested");
        Ok(self.maybe_destroy(&mut state))
    }

    fn maybe_destroy(&self, state: &mut DbState) -> bool {
        if state.free_requested
            && state.num_users == 0
            && state.internal_users == 0
            && !state.destroyed
        {
            state.destroyed = true;
            tracing::debug!(guid = ?self.guid, size = self.size, "destroying datablock");
            true
        } else {
            false
        }
    }

    /// Whether the block has been logically destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Current (user, internal) acquisition counts.
    #[must_use]
    pub fn user_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.num_users, state.internal_users)
    }

    /// Runtime-internal byte access for blocks the runtime itself owns
    /// (waiter lists). Caller must hold an internal acquisition.
    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let _state = self.state.lock();
        // Safety: the state lock serializes all runtime-internal access and
        // the block cannot be destroyed while an internal acquisition is
        // held.
        let bytes = unsafe { &mut **self.data.get() };
        f(bytes)
    }
}

impl fmt::Debug for Datablock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Datablock")
            .field("guid", &self.guid)
            .field("size", &self.size)
            .field("num_users", &state.num_users)
            .field("internal_users", &state.internal_users)
            .field("free_requested", &state.free_requested)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GuidKind;

    fn db() -> Datablock {
        Datablock::new(
            Guid::pack(GuidKind::Datablock, 0, 1),
            128,
            DbFlags::empty(),
        )
    }

    fn edt(n: u64) -> Guid {
        Guid::pack(GuidKind::Edt, 0, n)
    }

    #[test]
    fn reacquire_is_idempotent() {
        let db = db();
        let a = db.acquire(edt(1), AccessMode::Rw, false).unwrap();
        let b = db.acquire(edt(1), AccessMode::Rw, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.user_counts(), (1, 0));
    }

    #[test]
    fn ew_is_reserved() {
        let db = db();
        assert_eq!(
            db.acquire(edt(1), AccessMode::Ew, false).unwrap_err(),
            RuntimeError::NotSupported
        );
    }

    #[test]
    fn foreign_release_is_unauthorised() {
        let db = db();
        db.acquire(edt(1), AccessMode::Rw, false).unwrap();
        assert_eq!(
            db.release(edt(2), false).unwrap_err(),
            RuntimeError::Unauthorised
        );
    }

    #[test]
    fn free_is_deferred_until_last_release() {
        let db = db();
        db.acquire(edt(1), AccessMode::Rw, false).unwrap();
        db.acquire(edt(2), AccessMode::Ro, false).unwrap();

        // Free requested by a third party: nothing holds it back except the
        // two outstanding acquisitions.
        assert!(!db.request_free(edt(3)).unwrap());
        assert!(!db.is_destroyed());

        // New acquisitions are refused now.
        assert_eq!(
            db.acquire(edt(4), AccessMode::Rw, false).unwrap_err(),
            RuntimeError::Unauthorised
        );

        assert!(!db.release(edt(1), false).unwrap());
        assert!(db.release(edt(2), false).unwrap());
        assert!(db.is_destroyed());
    }

    #[test]
    fn internal_rerelease_tolerated() {
        let db = db();
        db.acquire(edt(1), AccessMode::Const, true).unwrap();
        assert!(!db.release(edt(1), true).unwrap());
        // Spurious second internal release does not fail.
        assert!(!db.release(edt(1), true).unwrap());
        assert_eq!(db.user_counts(), (0, 0));
    }

    #[test]
    fn free_by_holder_releases_first() {
        let db = db();
        db.acquire(edt(1), AccessMode::Rw, false).unwrap();
        assert!(db.request_free(edt(1)).unwrap());
        assert!(db.is_destroyed());
    }
}
