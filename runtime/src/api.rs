// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The user-facing API surface.
//!
//! There is no process-wide state: every call goes through an
//! [`EdtContext`], which wraps the calling policy domain (and the running
//! task, inside task functions). Each operation builds the corresponding
//! message and feeds it to the dispatcher, exactly like a request arriving
//! from any other domain.

use crate::datablock::{AccessMode, DbFlags};
use crate::error::RuntimeError;
use crate::event::EventKind;
use crate::guid::{Guid, GuidKind, LabeledProps, Location};
use crate::hint::HintRecord;
use crate::message::{Message, Payload};
use crate::policy::PolicyDomain;
use crate::runlevel::{Runlevel, RunlevelProps};
use crate::task::{Edt, EdtFn, EdtProps};
use smallvec::SmallVec;
use std::sync::Arc;

/// The execution context handed to task functions and embedders.
#[derive(Debug, Clone, Copy)]
pub struct EdtContext<'a> {
    pd: &'a PolicyDomain,
    edt: Option<&'a Arc<Edt>>,
}

impl<'a> EdtContext<'a> {
    /// A context outside any task, for embedders driving the runtime.
    #[must_use]
    pub fn new(pd: &'a PolicyDomain) -> Self {
        Self { pd, edt: None }
    }

    pub(crate) fn for_edt(pd: &'a PolicyDomain, edt: &'a Arc<Edt>) -> Self {
        Self { pd, edt: Some(edt) }
    }

    /// The policy domain this context runs on.
    #[must_use]
    pub fn pd(&self) -> &PolicyDomain {
        self.pd
    }

    /// The running task, or `NULL` outside task context.
    #[must_use]
    pub fn current_edt(&self) -> Guid {
        self.edt.map_or(Guid::NULL, |edt| edt.guid())
    }

    fn request(&self, dest: Location, payload: Payload) -> Result<Message, RuntimeError> {
        let mut msg = Message::request(self.pd.location(), dest, payload);
        self.pd.process_message(&mut msg, true)?;
        Ok(msg)
    }

    fn local(&self, payload: Payload) -> Result<Message, RuntimeError> {
        self.request(self.pd.location(), payload)
    }

    // --- datablocks ---

    /// Creates a datablock and, unless [`DbFlags::NO_ACQUIRE`] is given,
    /// acquires it for the calling task.
    ///
    /// # Errors
    ///
    /// `NoMemory` when allocation fails.
    pub fn create_datablock(
        &self,
        size: u64,
        flags: DbFlags,
        hint: HintRecord,
        mode: AccessMode,
    ) -> Result<(Guid, *mut u8), RuntimeError> {
        let msg = self.local(Payload::DbCreate {
            size,
            flags,
            hint,
            mode,
            edt: self.current_edt(),
            out_guid: Guid::NULL,
            out_addr: 0,
        })?;
        let Payload::DbCreate {
            out_guid, out_addr, ..
        } = msg.payload
        else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok((out_guid, out_addr as *mut u8))
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn destroy_datablock(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(guid.location(), Payload::DbDestroy { guid })
            .map(|_| ())
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn acquire(&self, guid: Guid, mode: AccessMode) -> Result<*mut u8, RuntimeError> {
        let msg = self.request(
            guid.location(),
            Payload::DbAcquire {
                guid,
                edt: self.current_edt(),
                mode,
                internal: false,
                out_addr: 0,
                out_size: 0,
            },
        )?;
        let Payload::DbAcquire { out_addr, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_addr as *mut u8)
    }

    /// # Errors
    ///
    /// `Unauthorised` when the caller never acquired `guid`.
    pub fn release(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(
            guid.location(),
            Payload::DbRelease {
                guid,
                edt: self.current_edt(),
                internal: false,
            },
        )
        .map(|_| ())
    }

    /// Requests destruction of a datablock; deferred until the last
    /// acquirer releases.
    ///
    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn free(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(
            guid.location(),
            Payload::DbFree {
                guid,
                edt: self.current_edt(),
            },
        )
        .map(|_| ())
    }

    // --- events ---

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn create_event(&self, kind: EventKind) -> Result<Guid, RuntimeError> {
        let msg = self.local(Payload::EvtCreate {
            kind,
            label: Guid::NULL,
            label_props: LabeledProps::empty(),
            out_guid: Guid::NULL,
        })?;
        let Payload::EvtCreate { out_guid, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_guid)
    }

    /// Creates an event under a caller-supplied labeled GUID. The request
    /// routes to the label's home domain.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on a `CHECK` collision.
    pub fn create_event_labeled(
        &self,
        kind: EventKind,
        label: Guid,
        props: LabeledProps,
    ) -> Result<Guid, RuntimeError> {
        let msg = self.request(
            label.location(),
            Payload::EvtCreate {
                kind,
                label,
                label_props: props | LabeledProps::IS_LABELED,
                out_guid: Guid::NULL,
            },
        )?;
        let Payload::EvtCreate { out_guid, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_guid)
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn destroy_event(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(guid.location(), Payload::EvtDestroy { guid })
            .map(|_| ())
    }

    /// Satisfies slot 0 of `guid` with `payload`.
    ///
    /// # Errors
    ///
    /// `DuplicateSatisfy` on a second sticky satisfy.
    pub fn satisfy(&self, guid: Guid, payload: Guid) -> Result<(), RuntimeError> {
        self.satisfy_slot(guid, payload, 0)
    }

    /// # Errors
    ///
    /// See [`Self::satisfy`].
    pub fn satisfy_slot(&self, guid: Guid, payload: Guid, slot: u32) -> Result<(), RuntimeError> {
        self.request(
            guid.location(),
            Payload::EvtSatisfy {
                guid,
                payload,
                slot,
            },
        )
        .map(|_| ())
    }

    /// Reads an event's current payload without consuming anything.
    ///
    /// # Errors
    ///
    /// `InvalidGuid` for destroyed events.
    pub fn event_get(&self, guid: Guid) -> Result<Guid, RuntimeError> {
        let msg = self.request(
            guid.location(),
            Payload::EvtGet {
                guid,
                out_payload: Guid::NULL,
            },
        )?;
        let Payload::EvtGet { out_payload, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_payload)
    }

    // --- tasks ---

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn create_template(
        &self,
        func: EdtFn,
        paramc: u32,
        depc: u32,
    ) -> Result<Guid, RuntimeError> {
        let msg = self.local(Payload::TemplateCreate {
            func,
            paramc,
            depc,
            out_guid: Guid::NULL,
        })?;
        let Payload::TemplateCreate { out_guid, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_guid)
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn destroy_template(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(guid.location(), Payload::TemplateDestroy { guid })
            .map(|_| ())
    }

    /// Creates a task from `template`.
    ///
    /// `depv` entries pre-add dependences; pass `UNINITIALIZED` entries (or
    /// an empty slice) to add them later via [`Self::add_dependence`]. The
    /// task is created on `affinity`'s domain when given. Returns the task
    /// and its output event (`NULL` unless `request_output_event`).
    ///
    /// # Errors
    ///
    /// `InvalidArg` on parameter/dependence count mismatches.
    pub fn create_edt(
        &self,
        template: Guid,
        paramv: &[u64],
        depv: &[Guid],
        props: EdtProps,
        affinity: Option<Location>,
        request_output_event: bool,
    ) -> Result<(Guid, Guid), RuntimeError> {
        let dest = affinity.unwrap_or_else(|| self.pd.location());
        let msg = self.request(
            dest,
            Payload::EdtCreate {
                template,
                paramv: SmallVec::from_slice(paramv),
                depv: SmallVec::from_slice(depv),
                props,
                request_output_event,
                creator: self.current_edt(),
                out_guid: Guid::NULL,
                out_event: Guid::NULL,
            },
        )?;
        let Payload::EdtCreate {
            out_guid,
            out_event,
            ..
        } = msg.payload
        else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok((out_guid, out_event))
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn destroy_edt(&self, guid: Guid) -> Result<(), RuntimeError> {
        self.request(guid.location(), Payload::EdtDestroy { guid })
            .map(|_| ())
    }

    // --- dependences ---

    /// Adds the dependence `src → dst@slot` with the given access mode.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for unsupported source/destination combinations.
    pub fn add_dependence(
        &self,
        src: Guid,
        dst: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<(), RuntimeError> {
        self.request(
            dst.location(),
            Payload::DepAdd {
                src,
                dst,
                slot,
                mode,
            },
        )
        .map(|_| ())
    }

    // --- task-local storage ---

    /// Reads an EDT-local storage slot.
    ///
    /// # Errors
    ///
    /// `InvalidArg` outside task context.
    pub fn els_get(&self, offset: usize) -> Result<u64, RuntimeError> {
        self.edt
            .map(|edt| edt.els_get(offset))
            .ok_or(RuntimeError::InvalidArg)
    }

    /// Writes an EDT-local storage slot.
    ///
    /// # Errors
    ///
    /// `InvalidArg` outside task context.
    pub fn els_set(&self, offset: usize, value: u64) -> Result<(), RuntimeError> {
        self.edt
            .map(|edt| edt.els_set(offset, value))
            .ok_or(RuntimeError::InvalidArg)
    }

    // --- guid service ---

    /// Pre-reserves `count` labeled handles of `kind`.
    ///
    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn guid_reserve(&self, count: u64, kind: GuidKind) -> Result<(Guid, u64), RuntimeError> {
        let msg = self.local(Payload::GuidReserve {
            count,
            kind,
            out_start: Guid::NULL,
            out_stride: 0,
        })?;
        let Payload::GuidReserve {
            out_start,
            out_stride,
            ..
        } = msg.payload
        else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok((out_start, out_stride))
    }

    // --- hints ---

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn hint_set(&self, guid: Guid, hint: HintRecord) -> Result<(), RuntimeError> {
        self.request(guid.location(), Payload::HintSet { guid, hint })
            .map(|_| ())
    }

    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn hint_get(&self, guid: Guid) -> Result<HintRecord, RuntimeError> {
        let msg = self.request(
            guid.location(),
            Payload::HintGet {
                guid,
                out_hint: HintRecord::default(),
            },
        )?;
        let Payload::HintGet { out_hint, .. } = msg.payload else {
            unreachable!("payload variant is stable across dispatch")
        };
        Ok(out_hint)
    }

    // --- management ---

    /// Requests platform shutdown with the given exit code. Any worker may
    /// call this; the first request wins, later ones are absorbed.
    ///
    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn shutdown(&self, code: u64) -> Result<(), RuntimeError> {
        self.local(Payload::MgtRlNotify {
            runlevel: Runlevel::UserOk,
            props: RunlevelProps::TEAR_DOWN | RunlevelProps::REQUEST | RunlevelProps::BARRIER,
            code,
        })
        .map(|_| ())
    }

    /// Prints through the system abstraction layer.
    ///
    /// # Errors
    ///
    /// Forwards the engine status.
    pub fn sal_print(&self, text: impl Into<String>) -> Result<(), RuntimeError> {
        self.local(Payload::SalPrint { text: text.into() }).map(|_| ())
    }
}
