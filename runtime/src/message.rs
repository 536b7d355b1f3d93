// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The uniform message record carrying every runtime request.
//!
//! All mutation, whether from the user API, from other policy domains or
//! from worker internals, travels as a [`Message`] through
//! [`PolicyDomain::process_message`](crate::policy::PolicyDomain::process_message).
//! Input fields are filled by the requester; output (`out_*`) fields are
//! packaged in place by the handling domain before the message flows back.

use crate::datablock::{AccessMode, DbFlags};
use crate::error::RuntimeError;
use crate::event::EventKind;
use crate::guid::{Guid, GuidKind, LabeledProps, Location};
use crate::hint::HintRecord;
use crate::runlevel::{Runlevel, RunlevelProps};
use crate::task::{EdtFn, EdtProps};
use smallvec::SmallVec;

bitflags::bitflags! {
    /// Direction and handling flags of a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageProps: u32 {
        const REQUEST = 1 << 0;
        const RESPONSE = 1 << 1;
        /// The requester wants the response fields filled in.
        const REQ_RESPONSE = 1 << 2;
    }
}

/// A runtime request or response.
#[derive(Debug)]
pub struct Message {
    pub src: Location,
    pub dest: Location,
    pub props: MessageProps,
    /// Forwarding hops taken so far; bounded by the three-hop routing
    /// scheme.
    pub hops: u32,
    /// Response slot the dispatcher copies the engine status into.
    pub status: Result<(), RuntimeError>,
    pub payload: Payload,
}

impl Message {
    #[must_use]
    pub fn request(src: Location, dest: Location, payload: Payload) -> Self {
        Self {
            src,
            dest,
            props: MessageProps::REQUEST | MessageProps::REQ_RESPONSE,
            hops: 0,
            status: Ok(()),
            payload,
        }
    }

    /// Short tag of the payload variant, for tracing.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.payload.kind_name()
    }
}

/// Type-specific payload of a [`Message`], one variant per request type.
#[derive(Debug)]
pub enum Payload {
    // --- datablocks ---
    DbCreate {
        size: u64,
        flags: DbFlags,
        hint: HintRecord,
        mode: AccessMode,
        /// Acquiring task; `NULL` outside task context.
        edt: Guid,
        out_guid: Guid,
        /// Base address of the acquired region; zero without acquisition.
        out_addr: u64,
    },
    DbDestroy {
        guid: Guid,
    },
    DbAcquire {
        guid: Guid,
        edt: Guid,
        mode: AccessMode,
        internal: bool,
        out_addr: u64,
        out_size: u64,
    },
    DbRelease {
        guid: Guid,
        edt: Guid,
        internal: bool,
    },
    DbFree {
        guid: Guid,
        edt: Guid,
    },

    // --- raw memory ---
    MemAlloc {
        size: u64,
        level: u32,
        out_guid: Guid,
        out_addr: u64,
    },
    MemUnalloc {
        guid: Guid,
    },

    // --- events ---
    EvtCreate {
        kind: EventKind,
        /// Caller-supplied handle for labeled creation; `NULL` otherwise.
        label: Guid,
        label_props: LabeledProps,
        out_guid: Guid,
    },
    EvtDestroy {
        guid: Guid,
    },
    EvtSatisfy {
        guid: Guid,
        payload: Guid,
        slot: u32,
    },
    EvtGet {
        guid: Guid,
        out_payload: Guid,
    },

    // --- tasks ---
    EdtCreate {
        template: Guid,
        paramv: SmallVec<[u64; 8]>,
        depv: SmallVec<[Guid; 8]>,
        props: EdtProps,
        request_output_event: bool,
        /// Creating task, for finish-scope inheritance.
        creator: Guid,
        out_guid: Guid,
        out_event: Guid,
    },
    EdtDestroy {
        guid: Guid,
    },
    EdtSchedule {
        guid: Guid,
    },
    WorkExecute {
        guid: Guid,
    },
    TemplateCreate {
        func: EdtFn,
        paramc: u32,
        depc: u32,
        out_guid: Guid,
    },
    TemplateDestroy {
        guid: Guid,
    },

    // --- dependences ---
    DepAdd {
        src: Guid,
        dst: Guid,
        slot: u32,
        mode: AccessMode,
    },
    DepRegSignaler {
        dst: Guid,
        signaler: Guid,
        slot: u32,
        mode: AccessMode,
        /// The lowering already registered a waiter on the signaler.
        registered: bool,
    },
    DepRegWaiter {
        event: Guid,
        waiter: Guid,
        slot: u32,
    },
    DepSatisfy {
        satisfier: Guid,
        dst: Guid,
        payload: Guid,
        slot: u32,
    },

    // --- guid service ---
    GuidCreate {
        kind: GuidKind,
        /// Caller-supplied handle for labeled creation.
        label: Guid,
        props: LabeledProps,
        out_guid: Guid,
    },
    GuidDestroy {
        guid: Guid,
    },
    GuidInfo {
        guid: Guid,
        out_kind: GuidKind,
        out_location: Location,
    },
    GuidReserve {
        count: u64,
        kind: GuidKind,
        out_start: Guid,
        out_stride: u64,
    },
    GuidUnreserve {
        start: Guid,
        count: u64,
    },
    GuidMetadataClone {
        guid: Guid,
        out_location: Location,
    },

    // --- inter-domain work movement ---
    CommTake {
        requester: Location,
        max: u32,
        out_edts: SmallVec<[Guid; 4]>,
    },
    CommGive {
        edts: SmallVec<[Guid; 4]>,
    },

    // --- scheduler ---
    SchedGetWork {
        worker: u32,
        out_edt: Guid,
    },
    SchedNotify {
        kind: u32,
        guid: Guid,
    },
    SchedUpdate {
        kind: u32,
    },

    // --- hints ---
    HintSet {
        guid: Guid,
        hint: HintRecord,
    },
    HintGet {
        guid: Guid,
        out_hint: HintRecord,
    },

    // --- management ---
    MgtRlNotify {
        runlevel: Runlevel,
        props: RunlevelProps,
        code: u64,
    },

    // --- system abstraction layer ---
    SalPrint {
        text: String,
    },
    SalRead {
        out_byte: u8,
    },
    SalWrite {
        byte: u8,
    },
}

impl Payload {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::DbCreate { .. } => "DB_CREATE",
            Payload::DbDestroy { .. } => "DB_DESTROY",
            Payload::DbAcquire { .. } => "DB_ACQUIRE",
            Payload::DbRelease { .. } => "DB_RELEASE",
            Payload::DbFree { .. } => "DB_FREE",
            Payload::MemAlloc { .. } => "MEM_ALLOC",
            Payload::MemUnalloc { .. } => "MEM_UNALLOC",
            Payload::EvtCreate { .. } => "EVT_CREATE",
            Payload::EvtDestroy { .. } => "EVT_DESTROY",
            Payload::EvtSatisfy { .. } => "EVT_SATISFY",
            Payload::EvtGet { .. } => "EVT_GET",
            Payload::EdtCreate { .. } => "EDT_CREATE",
            Payload::EdtDestroy { .. } => "EDT_DESTROY",
            Payload::EdtSchedule { .. } => "EDT_SCHEDULE",
            Payload::WorkExecute { .. } => "WORK_EXECUTE",
            Payload::TemplateCreate { .. } => "TEMPLATE_CREATE",
            Payload::TemplateDestroy { .. } => "TEMPLATE_DESTROY",
            Payload::DepAdd { .. } => "DEP_ADD",
            Payload::DepRegSignaler { .. } => "DEP_REGSIGNALER",
            Payload::DepRegWaiter { .. } => "DEP_REGWAITER",
            Payload::DepSatisfy { .. } => "DEP_SATISFY",
            Payload::GuidCreate { .. } => "GUID_CREATE",
            Payload::GuidDestroy { .. } => "GUID_DESTROY",
            Payload::GuidInfo { .. } => "GUID_INFO",
            Payload::GuidReserve { .. } => "GUID_RESERVE",
            Payload::GuidUnreserve { .. } => "GUID_UNRESERVE",
            Payload::GuidMetadataClone { .. } => "GUID_METADATA_CLONE",
            Payload::CommTake { .. } => "COMM_TAKE",
            Payload::CommGive { .. } => "COMM_GIVE",
            Payload::SchedGetWork { .. } => "SCHED_GET_WORK",
            Payload::SchedNotify { .. } => "SCHED_NOTIFY",
            Payload::SchedUpdate { .. } => "SCHED_UPDATE",
            Payload::HintSet { .. } => "HINT_SET",
            Payload::HintGet { .. } => "HINT_GET",
            Payload::MgtRlNotify { .. } => "MGT_RL_NOTIFY",
            Payload::SalPrint { .. } => "SAL_PRINT",
            Payload::SalRead { .. } => "SAL_READ",
            Payload::SalWrite { .. } => "SAL_WRITE",
        }
    }
}
