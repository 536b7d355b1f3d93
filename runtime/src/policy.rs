// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Policy domains and the message dispatcher.
//!
//! A policy domain is the unit of locality: it owns its GUID provider, its
//! two strand tables, a work queue and its workers, plus routing knowledge
//! towards the rest of the hierarchy (block → cluster → root).
//! [`PolicyDomain::process_message`] is the single entry point for all
//! mutation: it validates, deguidifies, invokes the engine, packages the
//! response in place and returns or forwards.

use crate::config::PlatformConfig;
use crate::datablock::{AccessMode, Datablock, DbFlags};
use crate::error::RuntimeError;
use crate::event::EventRecord;
use crate::guid::{Guid, GuidKind, GuidObject, GuidProvider, LabeledProps, Location};
use crate::hint::{HintRecord, prescription, prescription_levels};
use crate::message::{Message, MessageProps, Payload};
use crate::runlevel::RunlevelState;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;
use smallvec::SmallVec;
use spin::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use strand_table::{
    Action, EventData, MicroEvent, Processor, ProcessProps, StrandError, StrandStatus,
    StrandTables, TableKind, WorkClass, WorkerId,
};

/// Number of routing hops a message may take: requester → cluster head →
/// destination cluster head → destination block.
const MAX_HOPS: u32 = 3;

/// The whole platform: every policy domain plus the topology they share.
#[derive(Debug)]
pub struct Platform {
    pds: Vec<Arc<PolicyDomain>>,
    config: PlatformConfig,
}

impl Platform {
    /// Builds the policy-domain hierarchy described by `config`.
    #[must_use]
    pub fn new(config: PlatformConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Platform>| {
            let pds = (0..config.domain_count())
                .map(|location| Arc::new(PolicyDomain::new(location, config, weak.clone())))
                .collect();
            Self { pds, config }
        })
    }

    /// The policy domain at `location`.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range location; locations come from GUIDs minted
    /// by the platform itself.
    #[must_use]
    pub fn pd(&self, location: Location) -> &Arc<PolicyDomain> {
        &self.pds[location as usize]
    }

    #[must_use]
    pub fn domains(&self) -> &[Arc<PolicyDomain>] {
        &self.pds
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Brings the platform up through the runlevel ladder.
    ///
    /// # Errors
    ///
    /// Forwards barrier failures.
    pub fn boot(&self) -> Result<(), RuntimeError> {
        use crate::runlevel::{Runlevel, RunlevelProps};
        for level in Runlevel::ALL {
            self.pd(0)
                .rl_switch(level, RunlevelProps::BRING_UP | RunlevelProps::PD_MASTER, 0)?;
        }
        tracing::info!(domains = self.pds.len(), "platform up");
        Ok(())
    }

    /// Tears the platform down through the runlevel ladder in reverse,
    /// draining the micro-task tables on the way.
    ///
    /// # Errors
    ///
    /// Forwards barrier failures.
    pub fn teardown(&self) -> Result<(), RuntimeError> {
        use crate::runlevel::{Runlevel, RunlevelProps};
        let code = self.pd(0).shutdown_code();
        for pd in &self.pds {
            pd.drain_strands()?;
        }
        for level in Runlevel::ALL.iter().rev() {
            self.pd(0)
                .rl_switch(*level, RunlevelProps::TEAR_DOWN | RunlevelProps::PD_MASTER, code)?;
        }
        for pd in &self.pds {
            pd.strands().reset();
        }
        tracing::info!(code, "platform down");
        Ok(())
    }

    /// One cooperative sweep over every domain: runs ready tasks and drains
    /// strands. Returns `true` when any domain made progress. This is the
    /// single-threaded driver; multi-threaded deployments use
    /// [`crate::worker::Worker`] instead.
    pub fn drive(&self) -> bool {
        let mut progress = false;
        for pd in &self.pds {
            progress |= pd.worker_tick(0, WorkClass::Work, None);
            progress |= pd.worker_tick(1, WorkClass::Comm, None);
        }
        progress
    }

    /// Drives the platform until some worker requests shutdown, then
    /// quiesces remaining work.
    ///
    /// # Errors
    ///
    /// `Busy` when the platform goes idle without a shutdown request within
    /// `idle_limit` sweeps (a stuck dependence graph).
    pub fn run_until_shutdown(&self, idle_limit: u32) -> Result<u64, RuntimeError> {
        let mut idle = 0;
        while !self.shutdown_requested() {
            if self.drive() {
                idle = 0;
            } else {
                idle += 1;
                if idle > idle_limit {
                    return Err(RuntimeError::Busy);
                }
            }
        }
        // Quiesce in-flight work so teardown sees empty tables.
        while self.drive() {}
        Ok(self.pd(0).shutdown_code())
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.pds.iter().any(|pd| pd.shutdown_requested())
    }

    /// Total registered GUIDs across all domains; zero after a clean
    /// shutdown.
    #[must_use]
    pub fn outstanding_guids(&self) -> usize {
        self.pds.iter().map(|pd| pd.guids().outstanding()).sum()
    }
}

/// One policy domain.
pub struct PolicyDomain {
    location: Location,
    config: PlatformConfig,
    platform: Weak<Platform>,
    guids: GuidProvider,
    strands: StrandTables<Message>,
    sched: Mutex<VecDeque<Guid>>,
    runlevel: RunlevelState,
    hints: RwLock<HashMap<u64, HintRecord>>,
    /// Round-robin cursor over same-cluster neighbors for work stealing.
    comm_rr: AtomicU32,
    /// Outstanding neighbor steal requests; bounds contention.
    comm_outstanding: AtomicU32,
    /// Spread seed for strands parked outside a worker context.
    post_seq: AtomicU32,
    shutdown_flag: AtomicBool,
    shutdown_code: AtomicU64,
}

impl core::fmt::Debug for PolicyDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PolicyDomain")
            .field("location", &self.location)
            .field("outstanding_guids", &self.guids.outstanding())
            .finish_non_exhaustive()
    }
}

impl PolicyDomain {
    fn new(location: Location, config: PlatformConfig, platform: Weak<Platform>) -> Self {
        Self {
            location,
            config,
            platform,
            guids: GuidProvider::new(location),
            strands: StrandTables::new(config.strand),
            sched: Mutex::new(VecDeque::new()),
            runlevel: RunlevelState::default(),
            hints: RwLock::new(HashMap::new()),
            comm_rr: AtomicU32::new(0),
            comm_outstanding: AtomicU32::new(0),
            post_seq: AtomicU32::new(0),
            shutdown_flag: AtomicBool::new(false),
            shutdown_code: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn guids(&self) -> &GuidProvider {
        &self.guids
    }

    #[inline]
    #[must_use]
    pub fn strands(&self) -> &StrandTables<Message> {
        &self.strands
    }

    #[inline]
    pub(crate) fn runlevel(&self) -> &RunlevelState {
        &self.runlevel
    }

    // --- topology ---

    fn cluster(&self) -> u32 {
        self.location / self.config.blocks_per_cluster
    }

    fn block(&self) -> u32 {
        self.location % self.config.blocks_per_cluster
    }

    fn cluster_head(cluster: u32, config: &PlatformConfig) -> Location {
        cluster * config.blocks_per_cluster
    }

    pub(crate) fn parent_location(&self) -> Option<Location> {
        if self.block() != 0 {
            Some(Self::cluster_head(self.cluster(), &self.config))
        } else if self.cluster() != 0 {
            Some(Self::cluster_head(0, &self.config))
        } else {
            None
        }
    }

    pub(crate) fn child_locations(&self) -> Vec<Location> {
        let mut children = Vec::new();
        if self.block() == 0 {
            // Blocks of our own cluster.
            for block in 1..self.config.blocks_per_cluster {
                children.push(self.location + block);
            }
            if self.cluster() == 0 {
                // Root master also owns the other cluster heads.
                for cluster in 1..self.config.cluster_count {
                    children.push(Self::cluster_head(cluster, &self.config));
                }
            }
        }
        children
    }

    fn next_hop(&self, dest: Location) -> Location {
        let dest_cluster = dest / self.config.blocks_per_cluster;
        if dest_cluster == self.cluster() {
            // Same cluster: direct send to the neighbor block.
            dest
        } else if self.block() == 0 {
            // Cluster head: forward to the destination cluster's head.
            Self::cluster_head(dest_cluster, &self.config)
        } else {
            // Everyone else goes through the local cluster head.
            Self::cluster_head(self.cluster(), &self.config)
        }
    }

    fn platform(&self) -> Result<Arc<Platform>, RuntimeError> {
        self.platform.upgrade().ok_or(RuntimeError::InvalidGuid)
    }

    // --- shutdown state ---

    /// Captures the first shutdown request. Returns `true` for the capture.
    pub(crate) fn note_shutdown(&self, code: u64) -> bool {
        let first = self
            .shutdown_flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.shutdown_code.store(code, Ordering::Release);
        }
        first
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn shutdown_code(&self) -> u64 {
        self.shutdown_code.load(Ordering::Acquire)
    }

    // --- guid resolution ---

    /// Resolves a handle to its metadata, consulting the owning domain for
    /// non-local handles (the shared-memory form of a metadata clone).
    pub(crate) fn deguidify(&self, guid: Guid) -> Result<GuidObject, RuntimeError> {
        if guid.is_null() || guid.is_uninitialized() {
            return Err(RuntimeError::InvalidGuid);
        }
        if guid.location() == self.location {
            self.guids.deguidify(guid)
        } else {
            let platform = self.platform()?;
            platform.pd(guid.location()).guids().deguidify(guid)
        }
    }

    pub(crate) fn resolve_db(&self, guid: Guid) -> Result<Arc<Datablock>, RuntimeError> {
        match self.deguidify(guid)? {
            GuidObject::Datablock(db) => Ok(db),
            _ => Err(RuntimeError::InvalidGuid),
        }
    }

    pub(crate) fn resolve_event(&self, guid: Guid) -> Result<Arc<EventRecord>, RuntimeError> {
        match self.deguidify(guid)? {
            GuidObject::Event(event) => Ok(event),
            _ => Err(RuntimeError::InvalidGuid),
        }
    }

    // --- datablock engine glue ---

    pub(crate) fn db_create(
        &self,
        size: u64,
        flags: DbFlags,
        hint: HintRecord,
        mode: AccessMode,
        edt: Guid,
    ) -> Result<(Guid, u64), RuntimeError> {
        // One allocator level per platform in this configuration; the
        // prescription still decides the try order when there are more.
        let word = prescription(&hint, 1);
        let level = prescription_levels(word, 1)
            .next()
            .expect("prescription yields at least one level");
        let guid = self.guids.next_guid(GuidKind::Datablock);
        let db = Arc::new(Datablock::new(guid, size, flags));
        self.guids.register(guid, GuidObject::Datablock(Arc::clone(&db)));
        let addr = if flags.contains(DbFlags::NO_ACQUIRE) {
            0
        } else {
            db.acquire(edt, mode, flags.contains(DbFlags::INTERNAL))? as u64
        };
        tracing::debug!(?guid, size, level, "created datablock");
        Ok((guid, addr))
    }

    pub(crate) fn db_acquire(
        &self,
        guid: Guid,
        edt: Guid,
        mode: AccessMode,
        internal: bool,
    ) -> Result<(u64, u64), RuntimeError> {
        let db = self.resolve_db(guid)?;
        let ptr = db.acquire(edt, mode, internal)?;
        Ok((ptr as u64, db.size()))
    }

    pub(crate) fn db_release(
        &self,
        guid: Guid,
        edt: Guid,
        internal: bool,
    ) -> Result<(), RuntimeError> {
        let db = self.resolve_db(guid)?;
        if db.release(edt, internal)? {
            self.reap_db(guid)?;
        }
        Ok(())
    }

    pub(crate) fn db_free(&self, guid: Guid, edt: Guid) -> Result<(), RuntimeError> {
        let db = self.resolve_db(guid)?;
        if db.request_free(edt)? {
            self.reap_db(guid)?;
        }
        Ok(())
    }

    /// Unregisters a destroyed datablock from its owning domain.
    fn reap_db(&self, guid: Guid) -> Result<(), RuntimeError> {
        if guid.location() == self.location {
            self.guids.release(guid)
        } else {
            let platform = self.platform()?;
            platform.pd(guid.location()).guids().release(guid)
        }
    }

    /// Creates a runtime-internal datablock (waiter lists and the like),
    /// acquired by `owner`.
    pub(crate) fn db_create_internal(&self, owner: Guid, size: u64) -> Result<Guid, RuntimeError> {
        let (guid, _) = self.db_create(
            size,
            DbFlags::INTERNAL,
            HintRecord::default(),
            AccessMode::Const,
            owner,
        )?;
        Ok(guid)
    }

    /// Releases and frees a runtime-internal datablock.
    pub(crate) fn db_free_internal(&self, owner: Guid, guid: Guid) -> Result<(), RuntimeError> {
        self.db_free(guid, owner)
    }

    // --- scheduler queue ---

    pub(crate) fn sched_give(&self, edt: Guid) {
        self.sched.lock().push_back(edt);
    }

    pub(crate) fn sched_take(&self) -> Option<Guid> {
        self.sched.lock().pop_front()
    }

    /// Ready tasks currently queued here.
    #[must_use]
    pub fn sched_len(&self) -> usize {
        self.sched.lock().len()
    }

    // --- micro-task posting ---

    /// Parks `msg` as a ready message event on the event strand table with a
    /// process-message action of the given class; a worker of that class
    /// picks it up on its next drain pass.
    pub(crate) fn post_message(&self, msg: Message, class: WorkClass) {
        let seq = self.post_seq.fetch_add(1, Ordering::Relaxed);
        let event = Box::new(MicroEvent::new_msg(msg));
        let table = if class == WorkClass::Comm {
            TableKind::Comm
        } else {
            TableKind::Event
        };
        let strand = match self
            .strands
            .table(table)
            .get_new_strand(seq, event, StrandStatus::empty())
        {
            Ok(strand) => strand,
            Err(err) => {
                // Getting a fresh strand only fails on invalid properties.
                tracing::error!(%err, "could not park message");
                return;
            }
        };
        if let Err(err) =
            self.strands
                .enqueue_actions(seq, &strand, vec![Action::ProcessMessage(class)], true)
        {
            tracing::error!(%err, "could not enqueue parked message");
        }
    }

    /// Posts a dependence satisfaction towards `dst`.
    pub(crate) fn post_satisfy(&self, satisfier: Guid, dst: Guid, payload: Guid, slot: u32) {
        let msg = Message::request(
            self.location,
            dst.location(),
            Payload::DepSatisfy {
                satisfier,
                dst,
                payload,
                slot,
            },
        );
        self.post_message(msg, WorkClass::Work);
    }

    /// Drains both strand tables to empty; teardown path.
    pub(crate) fn drain_strands(&self) -> Result<(), RuntimeError> {
        self.strands.drain(self, 0)?;
        Ok(())
    }

    // --- worker driver ---

    /// One unit of worker effort: run a ready task (compute class), ask for
    /// more work when idle, and drain a batch of strands. Returns whether
    /// anything happened.
    pub(crate) fn worker_tick(
        &self,
        worker: WorkerId,
        class: WorkClass,
        rng: Option<&mut fastrand::Rng>,
    ) -> bool {
        let mut progress = false;
        if class == WorkClass::Work {
            let mut msg = Message::request(
                self.location,
                self.location,
                Payload::SchedGetWork {
                    worker,
                    out_edt: Guid::NULL,
                },
            );
            if self.process_message(&mut msg, true).is_ok() {
                if let Payload::SchedGetWork { out_edt, .. } = &msg.payload {
                    if !out_edt.is_null() {
                        let mut exec = Message::request(
                            self.location,
                            self.location,
                            Payload::WorkExecute { guid: *out_edt },
                        );
                        if let Err(err) = self.process_message(&mut exec, true) {
                            tracing::error!(?out_edt, %err, "task execution failed");
                        }
                        progress = true;
                    } else if !self.shutdown_requested() {
                        // Idle: maybe ask a neighbor for work. The jitter
                        // keeps a fleet of idle workers from stampeding the
                        // same victim.
                        let ask = rng.is_none_or(|rng| rng.u8(..) < 32);
                        if ask {
                            let mut steal = Message::request(
                                self.location,
                                self.location,
                                Payload::CommTake {
                                    requester: self.location,
                                    max: 1,
                                    out_edts: SmallVec::new(),
                                },
                            );
                            let _ = self.process_message(&mut steal, false);
                        }
                    }
                }
            }
        }
        match self
            .strands
            .process_strands(self, worker, class, ProcessProps::empty())
        {
            Ok(n) => progress |= n > 0,
            Err(err) => tracing::error!(%err, "strand processing failed"),
        }
        progress
    }

    // --- dispatcher ---

    /// The single entry point for all runtime mutation.
    ///
    /// Validates and routes the message, invokes the engine operation for
    /// local destinations, and packages the response in place.
    ///
    /// # Errors
    ///
    /// The engine status, which is also recorded in `msg.status`.
    pub fn process_message(
        &self,
        msg: &mut Message,
        blocking: bool,
    ) -> Result<(), RuntimeError> {
        if msg.dest != self.location {
            return self.forward(msg, blocking);
        }
        tracing::trace!(
            location = self.location,
            kind = msg.kind_name(),
            src = msg.src,
            "dispatching message"
        );
        let result = self.dispatch_local(msg, blocking);
        msg.status = result;
        msg.props.remove(MessageProps::REQUEST);
        msg.props.insert(MessageProps::RESPONSE);
        if let Err(err) = result {
            tracing::debug!(
                location = self.location,
                kind = msg.kind_name(),
                %err,
                "message failed"
            );
        }
        result
    }

    fn forward(&self, msg: &mut Message, blocking: bool) -> Result<(), RuntimeError> {
        msg.hops += 1;
        if msg.hops > MAX_HOPS {
            return Err(RuntimeError::InvalidArg);
        }
        let next = self.next_hop(msg.dest);
        tracing::trace!(
            location = self.location,
            dest = msg.dest,
            next,
            hops = msg.hops,
            kind = msg.kind_name(),
            "forwarding message"
        );
        let platform = self.platform()?;
        platform.pd(next).process_message(msg, blocking)
    }

    #[expect(clippy::too_many_lines, reason = "one arm per message type")]
    fn dispatch_local(&self, msg: &mut Message, _blocking: bool) -> Result<(), RuntimeError> {
        match &mut msg.payload {
            Payload::DbCreate {
                size,
                flags,
                hint,
                mode,
                edt,
                out_guid,
                out_addr,
            } => {
                let (guid, addr) = self.db_create(*size, *flags, *hint, *mode, *edt)?;
                *out_guid = guid;
                *out_addr = addr;
                Ok(())
            }
            Payload::DbDestroy { guid } => self.db_free(*guid, Guid::NULL),
            Payload::DbAcquire {
                guid,
                edt,
                mode,
                internal,
                out_addr,
                out_size,
            } => {
                let (addr, size) = self.db_acquire(*guid, *edt, *mode, *internal)?;
                *out_addr = addr;
                *out_size = size;
                Ok(())
            }
            Payload::DbRelease {
                guid,
                edt,
                internal,
            } => self.db_release(*guid, *edt, *internal),
            Payload::DbFree { guid, edt } => self.db_free(*guid, *edt),

            Payload::MemAlloc {
                size,
                level,
                out_guid,
                out_addr,
            } => {
                let _ = level;
                let (guid, addr) = self.db_create(
                    *size,
                    DbFlags::INTERNAL,
                    HintRecord::default(),
                    AccessMode::Rw,
                    Guid::NULL,
                )?;
                *out_guid = guid;
                *out_addr = addr;
                Ok(())
            }
            Payload::MemUnalloc { guid } => self.db_free(*guid, Guid::NULL),

            Payload::EvtCreate {
                kind,
                label,
                label_props,
                out_guid,
            } => {
                *out_guid = if label_props.contains(LabeledProps::IS_LABELED) {
                    self.evt_create_labeled(*kind, *label, *label_props)?
                } else {
                    self.evt_create(*kind)?
                };
                Ok(())
            }
            Payload::EvtDestroy { guid } => self.evt_destroy(*guid),
            Payload::EvtSatisfy {
                guid,
                payload,
                slot,
            } => self.evt_satisfy(*guid, *payload, *slot),
            Payload::EvtGet { guid, out_payload } => {
                *out_payload = self.evt_get(*guid)?;
                Ok(())
            }

            Payload::EdtCreate {
                template,
                paramv,
                depv,
                props,
                request_output_event,
                creator,
                out_guid,
                out_event,
            } => {
                let (guid, event) = self.edt_create(
                    *template,
                    paramv,
                    depv,
                    *props,
                    *request_output_event,
                    *creator,
                )?;
                *out_guid = guid;
                *out_event = event;
                Ok(())
            }
            Payload::EdtDestroy { guid } => self.edt_destroy(*guid),
            Payload::EdtSchedule { guid } => {
                self.sched_give(*guid);
                Ok(())
            }
            Payload::WorkExecute { guid } => self.edt_execute(*guid),
            Payload::TemplateCreate {
                func,
                paramc,
                depc,
                out_guid,
            } => {
                *out_guid = self.template_create(*func, *paramc, *depc);
                Ok(())
            }
            Payload::TemplateDestroy { guid } => self.template_destroy(*guid),

            Payload::DepAdd {
                src: dep_src,
                dst,
                slot,
                mode,
            } => self.dep_add(*dep_src, *dst, *slot, *mode),
            Payload::DepRegSignaler {
                dst,
                signaler,
                slot,
                mode,
                registered,
            } => self.evt_register_signaler(*dst, *signaler, *slot, *mode, *registered),
            Payload::DepRegWaiter {
                event,
                waiter,
                slot,
            } => self.evt_register_waiter(*event, *waiter, *slot),
            Payload::DepSatisfy {
                satisfier: _,
                dst,
                payload,
                slot,
            } => match dst.kind() {
                GuidKind::Edt => self.edt_satisfy_slot(*dst, *payload, *slot),
                kind if kind.is_event() => self.evt_satisfy(*dst, *payload, *slot),
                _ => Err(RuntimeError::InvalidArg),
            },

            Payload::GuidCreate {
                kind,
                label,
                props,
                out_guid,
            } => {
                if props.contains(LabeledProps::IS_LABELED) {
                    if label.location() != self.location || label.kind() != *kind {
                        return Err(RuntimeError::InvalidArg);
                    }
                    *out_guid = *label;
                } else {
                    *out_guid = self.guids.next_guid(*kind);
                }
                Ok(())
            }
            Payload::GuidDestroy { guid } => self.guids.release(*guid),
            Payload::GuidInfo {
                guid,
                out_kind,
                out_location,
            } => {
                *out_kind = guid.kind();
                *out_location = guid.location();
                Ok(())
            }
            Payload::GuidReserve {
                count,
                kind,
                out_start,
                out_stride,
            } => {
                let (start, stride) = self.guids.reserve(*count, *kind);
                *out_start = start;
                *out_stride = stride;
                Ok(())
            }
            Payload::GuidUnreserve { .. } => {
                // Reservations are monotonic in this design; nothing to
                // reclaim.
                Ok(())
            }
            Payload::GuidMetadataClone { guid, out_location } => {
                self.deguidify(*guid)?;
                *out_location = guid.location();
                Ok(())
            }

            Payload::CommTake {
                requester,
                max,
                out_edts,
            } => self.comm_take(*requester, *max, out_edts),
            Payload::CommGive { edts } => {
                for edt in edts.drain(..) {
                    self.sched_give(edt);
                }
                Ok(())
            }

            Payload::SchedGetWork { out_edt, .. } => {
                *out_edt = self.sched_take().unwrap_or(Guid::NULL);
                Ok(())
            }
            Payload::SchedNotify { kind, guid } => {
                tracing::trace!(kind, ?guid, "scheduler notified");
                Ok(())
            }
            Payload::SchedUpdate { kind } => {
                tracing::trace!(kind, "scheduler updated");
                Ok(())
            }

            Payload::HintSet { guid, hint } => {
                self.hints.write().insert(guid.bits(), *hint);
                Ok(())
            }
            Payload::HintGet { guid, out_hint } => {
                *out_hint = self
                    .hints
                    .read()
                    .get(&guid.bits())
                    .copied()
                    .unwrap_or_default();
                Ok(())
            }

            Payload::MgtRlNotify {
                runlevel,
                props,
                code,
            } => self.rl_notify(*runlevel, *props, *code),

            Payload::SalPrint { text } => {
                tracing::info!(target: "sal", location = self.location, "{text}");
                Ok(())
            }
            Payload::SalRead { .. } | Payload::SalWrite { .. } => {
                // No console in this configuration.
                Err(RuntimeError::NotSupported)
            }
        }
    }

    /// Handles a `COMM_TAKE`: local work first; when empty and the request
    /// came from one of our own workers, ask a neighbor round-robin, subject
    /// to the outstanding-request throttle. The neighbor's answer comes back
    /// asynchronously through the communication strand and is fed to the
    /// local scheduler. No retry on failure; another requester will retry.
    fn comm_take(
        &self,
        requester: Location,
        max: u32,
        out_edts: &mut SmallVec<[Guid; 4]>,
    ) -> Result<(), RuntimeError> {
        for _ in 0..max {
            match self.sched_take() {
                Some(edt) => out_edts.push(edt),
                None => break,
            }
        }
        if !out_edts.is_empty() || requester != self.location {
            return Ok(());
        }
        // Nothing local and our own worker is hungry: try to steal.
        if self.config.blocks_per_cluster < 2 {
            return Ok(());
        }
        let outstanding = self.comm_outstanding.load(Ordering::Acquire);
        if outstanding >= self.config.comm_take_limit {
            return Ok(());
        }
        self.comm_outstanding.fetch_add(1, Ordering::AcqRel);

        let cluster_base = Self::cluster_head(self.cluster(), &self.config);
        let step = self.comm_rr.fetch_add(1, Ordering::Relaxed);
        let mut victim = cluster_base + (step % self.config.blocks_per_cluster);
        if victim == self.location {
            victim = cluster_base + ((step + 1) % self.config.blocks_per_cluster);
        }
        tracing::trace!(location = self.location, victim, "stealing from neighbor");
        let steal = Message::request(
            self.location,
            victim,
            Payload::CommTake {
                requester: self.location,
                max,
                out_edts: SmallVec::new(),
            },
        );
        self.post_message(steal, WorkClass::Comm);
        // The answer arrives through the communication strand; the requester
        // should come back later.
        Err(RuntimeError::Pending)
    }

}

// === micro-task seam ===

impl Processor for PolicyDomain {
    type Msg = Message;

    /// Drains a parked message: dispatch it, then complete any steal
    /// protocol it carried.
    fn process_message(
        &self,
        worker: WorkerId,
        event: &mut MicroEvent<Message>,
    ) -> Result<(), StrandError> {
        let EventData::Msg(msg_event) = &mut event.data else {
            return Err(StrandError::InvalidArg);
        };
        let msg = &mut msg_event.msg;
        let result = PolicyDomain::process_message(self, msg, true);
        match result {
            Ok(()) => {}
            Err(err) => {
                // Engine failures are recorded in the message status; they
                // are not strand failures.
                tracing::debug!(worker, kind = msg.kind_name(), %err, "parked message failed");
            }
        }
        if let Payload::CommTake {
            requester,
            out_edts,
            ..
        } = &mut msg.payload
        {
            if *requester == self.location && msg.dest != self.location {
                // Our steal request came back; feed anything we got to the
                // local scheduler.
                self.comm_outstanding.fetch_sub(1, Ordering::AcqRel);
                if !out_edts.is_empty() {
                    let mut give = Message::request(
                        self.location,
                        self.location,
                        Payload::CommGive {
                            edts: core::mem::take(out_edts),
                        },
                    );
                    PolicyDomain::process_message(self, &mut give, true)
                        .map_err(StrandError::from)?;
                }
            }
        }
        Ok(())
    }

    fn process_event(
        &self,
        worker: WorkerId,
        event: &mut MicroEvent<Message>,
        continuation: u32,
    ) -> Result<(), StrandError> {
        // Continuation entry point; the strand owns restoring any context.
        tracing::trace!(worker, continuation, ready = event.is_ready(), "process event");
        Ok(())
    }
}
