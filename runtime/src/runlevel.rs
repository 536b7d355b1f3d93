// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Staged bring-up and tear-down of the platform.
//!
//! The runlevels form an ordered ladder; each transition is a hierarchical
//! barrier: switch locally in phase order, inform the children, count their
//! check-ins, report to the parent, then release the children with the
//! previous level's marker.

use crate::error::RuntimeError;
use crate::message::{Message, Payload};
use crate::policy::PolicyDomain;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// The ordered runlevels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Runlevel {
    ConfigParse = 0,
    NetworkOk = 1,
    PdOk = 2,
    MemoryOk = 3,
    GuidOk = 4,
    ComputeOk = 5,
    UserOk = 6,
}

impl Runlevel {
    /// All levels in bring-up order.
    pub const ALL: [Runlevel; 7] = [
        Runlevel::ConfigParse,
        Runlevel::NetworkOk,
        Runlevel::PdOk,
        Runlevel::MemoryOk,
        Runlevel::GuidOk,
        Runlevel::ComputeOk,
        Runlevel::UserOk,
    ];

    /// Number of local switch phases of this level in the given direction.
    #[must_use]
    pub fn phase_count(self, props: RunlevelProps) -> u32 {
        // Compute bring-up takes two phases: pin resources, then start
        // accepting work. Everything else is a single phase.
        if self == Runlevel::ComputeOk && props.contains(RunlevelProps::BRING_UP) {
            2
        } else {
            1
        }
    }

    #[must_use]
    pub fn prev(self) -> Option<Runlevel> {
        let idx = self as usize;
        (idx > 0).then(|| Self::ALL[idx - 1])
    }
}

bitflags::bitflags! {
    /// Property flags of a runlevel transition or notification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RunlevelProps: u32 {
        const BRING_UP = 1 << 0;
        const TEAR_DOWN = 1 << 1;
        const REQUEST = 1 << 2;
        const RESPONSE = 1 << 3;
        const RELEASE = 1 << 4;
        const BARRIER = 1 << 5;
        /// The transition was triggered by a message rather than locally.
        const FROM_MSG = 1 << 6;
        const PD_MASTER = 1 << 7;
        const NODE_MASTER = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    level: Runlevel,
    tearing_down: bool,
}

/// Per-domain barrier state of the runlevel protocol.
#[derive(Debug)]
pub struct RunlevelState {
    cursor: Mutex<Cursor>,
    /// Check-ins against the current barrier: child domains plus local
    /// workers, depending on the phase.
    checked_in: AtomicU32,
}

impl Default for RunlevelState {
    fn default() -> Self {
        Self {
            cursor: Mutex::new(Cursor {
                level: Runlevel::ConfigParse,
                tearing_down: false,
            }),
            checked_in: AtomicU32::new(0),
        }
    }
}

impl RunlevelState {
    pub(crate) fn note_checkin(&self) {
        self.checked_in.fetch_add(1, Ordering::AcqRel);
    }

    fn take_checkins(&self) -> u32 {
        self.checked_in.swap(0, Ordering::AcqRel)
    }

    /// Current level of this domain.
    pub fn level(&self) -> Runlevel {
        self.cursor.lock().level
    }

    /// Whether the domain is on the tear-down side of the ladder.
    pub fn tearing_down(&self) -> bool {
        self.cursor.lock().tearing_down
    }
}

// === runlevel protocol ===

impl PolicyDomain {
    /// Performs one runlevel transition on this domain and its subtree.
    ///
    /// Called by the platform on the root master and recursively (via
    /// `MGT_RL_NOTIFY` requests) on every descendant. The synchronous
    /// message fabric makes the child barrier implicit: a child's dispatch
    /// returns only after its whole subtree has switched, and the return is
    /// the check-in.
    ///
    /// # Errors
    ///
    /// Forwards failures from descendants.
    pub(crate) fn rl_switch(
        &self,
        target: Runlevel,
        props: RunlevelProps,
        code: u64,
    ) -> Result<(), RuntimeError> {
        let previous = {
            let mut cursor = self.runlevel().cursor.lock();
            let previous = cursor.level;
            cursor.level = target;
            cursor.tearing_down = props.contains(RunlevelProps::TEAR_DOWN);
            previous
        };

        // 1. Local switch across all modules, in phase order.
        for phase in 0..target.phase_count(props) {
            tracing::debug!(
                location = self.location(),
                ?target,
                phase,
                bring_up = props.contains(RunlevelProps::BRING_UP),
                "local runlevel switch"
            );
            self.rl_switch_modules(target, props, phase);
        }

        // 2. Inform the children of the target runlevel. Check-ins absorbed
        // from the shutdown race are consumed here; they belonged to the
        // notification barrier, not to this one.
        let stale = self.runlevel().take_checkins();
        if stale > 0 {
            tracing::trace!(location = self.location(), stale, "consumed absorbed check-ins");
        }
        let children = self.child_locations();
        let expected = u32::try_from(children.len()).unwrap_or(u32::MAX);
        for child in &children {
            let mut msg = Message::request(
                self.location(),
                *child,
                Payload::MgtRlNotify {
                    runlevel: target,
                    props: (props | RunlevelProps::REQUEST | RunlevelProps::FROM_MSG)
                        & !RunlevelProps::RELEASE,
                    code,
                },
            );
            self.process_message(&mut msg, true)?;
            // The synchronous return is the child's check-in.
            self.runlevel().note_checkin();
        }

        // 3. Wait for all children to report in.
        let checked_in = self.runlevel().take_checkins();
        debug_assert_eq!(checked_in, expected, "lost runlevel check-ins");

        // 4. Informing the parent is the return from this call.

        // 5. Release the children with the previous level's marker.
        for child in &children {
            let mut msg = Message::request(
                self.location(),
                *child,
                Payload::MgtRlNotify {
                    runlevel: previous,
                    props: props | RunlevelProps::RELEASE | RunlevelProps::FROM_MSG,
                    code,
                },
            );
            self.process_message(&mut msg, true)?;
        }
        Ok(())
    }

    /// Local per-module switch hook. The module set of this implementation
    /// switches implicitly; the hook keeps the phase structure observable.
    fn rl_switch_modules(&self, target: Runlevel, props: RunlevelProps, phase: u32) {
        let _ = (target, props, phase);
        if target == Runlevel::GuidOk && props.contains(RunlevelProps::TEAR_DOWN) {
            let outstanding = self.guids().outstanding();
            if outstanding > 0 {
                tracing::warn!(
                    location = self.location(),
                    outstanding,
                    "guids still registered at guid teardown"
                );
            }
        }
    }

    /// Handles an incoming `MGT_RL_NOTIFY`.
    pub(crate) fn rl_notify(
        &self,
        runlevel: Runlevel,
        props: RunlevelProps,
        code: u64,
    ) -> Result<(), RuntimeError> {
        if props.contains(RunlevelProps::RELEASE) {
            tracing::trace!(location = self.location(), ?runlevel, "barrier release");
            return Ok(());
        }
        if props.contains(RunlevelProps::TEAR_DOWN)
            && runlevel == Runlevel::UserOk
            && !props.contains(RunlevelProps::FROM_MSG)
        {
            // A worker-initiated shutdown request racing up from a leaf.
            return self.shutdown_request(code);
        }
        self.rl_switch(runlevel, props, code)
    }

    /// First shutdown request captures the code and propagates; subsequent
    /// ones are absorbed as barrier check-ins.
    pub(crate) fn shutdown_request(&self, code: u64) -> Result<(), RuntimeError> {
        if self.note_shutdown(code) {
            tracing::info!(location = self.location(), code, "shutdown captured");
            // Propagate outward: the parent races the same capture; all
            // other domains learn the code before tear-down begins.
            for peer in self
                .parent_location()
                .into_iter()
                .chain(self.child_locations())
            {
                let mut msg = Message::request(
                    self.location(),
                    peer,
                    Payload::MgtRlNotify {
                        runlevel: Runlevel::UserOk,
                        props: RunlevelProps::TEAR_DOWN
                            | RunlevelProps::REQUEST
                            | RunlevelProps::BARRIER,
                        code,
                    },
                );
                self.process_message(&mut msg, true)?;
            }
        } else {
            tracing::trace!(
                location = self.location(),
                "duplicate shutdown absorbed as check-in"
            );
            self.runlevel().note_checkin();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runlevels_are_ordered() {
        let mut prev = None;
        for level in Runlevel::ALL {
            if let Some(prev) = prev {
                assert!(prev < level);
            }
            assert_eq!(level.prev(), prev);
            prev = Some(level);
        }
    }

    #[test]
    fn compute_bring_up_has_two_phases() {
        assert_eq!(
            Runlevel::ComputeOk.phase_count(RunlevelProps::BRING_UP),
            2
        );
        assert_eq!(
            Runlevel::ComputeOk.phase_count(RunlevelProps::TEAR_DOWN),
            1
        );
    }
}
