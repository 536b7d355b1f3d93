// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors surfaced by the strand table layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandError {
    /// A malformed request: bad properties, an index outside the table, a
    /// handle with an unassigned table tag, or an event of the wrong variant
    /// for the requested operation.
    InvalidArg,
    /// The referenced strand or event is not in the expected state (already
    /// ready, already released, or currently claimed by another worker).
    Busy,
    /// The table could not grow.
    NoMemory,
    /// An action callback failed; the action has been re-queued at the head
    /// of its strand for retry.
    ActionFailed,
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandError::InvalidArg => f.write_str("invalid argument"),
            StrandError::Busy => f.write_str("strand or event busy"),
            StrandError::NoMemory => f.write_str("strand table allocation failed"),
            StrandError::ActionFailed => f.write_str("strand action failed"),
        }
    }
}

impl core::error::Error for StrandError {}
