// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::event::{MicroEvent, StrandId};
use crate::{StrandError, WorkClass};
use core::fmt;

/// Signature of a parked continuation callback.
///
/// The callback receives the strand's current event and the jump point
/// recorded when the continuation was parked.
pub type ContinuationFn<M> = fn(&mut MicroEvent<M>, u32) -> Result<(), StrandError>;

/// A parked continuation: a callback, the jump point to resume at, and a
/// scratch area holding whatever state the callback needs restored.
pub struct Continuation<M> {
    pub callback: ContinuationFn<M>,
    pub target_jump: u32,
    pub scratch: Vec<u8>,
}

impl<M> fmt::Debug for Continuation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("target_jump", &self.target_jump)
            .field("scratch_len", &self.scratch.len())
            .finish()
    }
}

/// A unit of deferred work attached to a strand.
///
/// Actions on one strand execute in enqueue order once the strand's event is
/// ready; actions on different strands are unordered. The work class of the
/// head action determines which worker type may drain the strand.
#[derive(Debug)]
pub enum Action<M> {
    /// Feed the strand's current event (which must carry a message) to the
    /// policy-domain dispatcher. The class decides whether a compute or a
    /// communication worker picks it up.
    ProcessMessage(WorkClass),
    /// Mark the event parked at the given strand ready.
    MarkReady(StrandId),
    /// Move the strand's current event into slot `position` of the merge
    /// event parked at `merge`, decrementing its outstanding count.
    SatisfyMerge { merge: StrandId, position: u32 },
    /// Call the policy domain's `processEvent` entry point with the strand's
    /// current event and this continuation id.
    ProcessEvent { continuation: u32 },
    /// Run a parked continuation callback.
    Continuation(Continuation<M>),
}

impl<M> Action<M> {
    /// The work class of this action.
    #[inline]
    #[must_use]
    pub fn class(&self) -> WorkClass {
        match self {
            Action::ProcessMessage(class) => *class,
            Action::MarkReady(_)
            | Action::SatisfyMerge { .. }
            | Action::ProcessEvent { .. }
            | Action::Continuation(_) => WorkClass::Work,
        }
    }
}
