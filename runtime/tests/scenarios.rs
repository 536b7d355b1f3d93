// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving full dependence graphs through a platform.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing_subscriber::util::SubscriberInitExt;
use tress::{
    AccessMode, DbFlags, DepItem, EdtContext, EdtProps, EventKind, Guid, HintRecord,
    LATCH_SLOT_DECR, LATCH_SLOT_INCR, Platform, PlatformConfig, RuntimeError,
};

fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

fn single_domain() -> std::sync::Arc<Platform> {
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    platform
}

// --- chain of three EDTs ---

static CHAIN_ORDER: Mutex<Vec<char>> = Mutex::new(Vec::new());

fn chain_a(ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    CHAIN_ORDER.lock().unwrap().push('A');
    ctx.satisfy(Guid::from_bits(paramv[0]), Guid::NULL).unwrap();
    Guid::NULL
}

fn chain_b(ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    CHAIN_ORDER.lock().unwrap().push('B');
    ctx.satisfy(Guid::from_bits(paramv[0]), Guid::NULL).unwrap();
    Guid::NULL
}

fn chain_c(ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[DepItem]) -> Guid {
    CHAIN_ORDER.lock().unwrap().push('C');
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn chain_of_three_edts() {
    let _trace = trace();
    CHAIN_ORDER.lock().unwrap().clear();

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let e1 = ctx.create_event(EventKind::Sticky).unwrap();
    let e2 = ctx.create_event(EventKind::Sticky).unwrap();
    let e3 = ctx.create_event(EventKind::Sticky).unwrap();

    let ta = ctx.create_template(chain_a, 1, 1).unwrap();
    let tb = ctx.create_template(chain_b, 1, 1).unwrap();
    let tc = ctx.create_template(chain_c, 0, 1).unwrap();

    ctx.create_edt(ta, &[e2.bits()], &[e1], EdtProps::empty(), None, false)
        .unwrap();
    ctx.create_edt(tb, &[e3.bits()], &[e2], EdtProps::empty(), None, false)
        .unwrap();
    ctx.create_edt(tc, &[], &[e3], EdtProps::empty(), None, false)
        .unwrap();

    ctx.satisfy(e1, Guid::NULL).unwrap();

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);
    assert_eq!(*CHAIN_ORDER.lock().unwrap(), vec!['A', 'B', 'C']);

    // Sticky events persist until destroyed; the templates likewise.
    for guid in [e1, e2, e3] {
        ctx.destroy_event(guid).unwrap();
    }
    for guid in [ta, tb, tc] {
        ctx.destroy_template(guid).unwrap();
    }
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- finish scope ---

static FINISH_ORDER: Mutex<Vec<char>> = Mutex::new(Vec::new());

fn finish_child(_ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    #[expect(clippy::cast_possible_truncation, reason = "test payload is ascii")]
    let tag = paramv[0] as u8;
    FINISH_ORDER.lock().unwrap().push(tag as char);
    Guid::NULL
}

fn finish_parent(ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    FINISH_ORDER.lock().unwrap().push('F');
    let template = Guid::from_bits(paramv[0]);
    ctx.create_edt(template, &[u64::from(b'X')], &[], EdtProps::empty(), None, false)
        .unwrap();
    ctx.create_edt(template, &[u64::from(b'Y')], &[], EdtProps::empty(), None, false)
        .unwrap();
    Guid::NULL
}

fn finish_gate(ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[DepItem]) -> Guid {
    FINISH_ORDER.lock().unwrap().push('Z');
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn finish_scope_gates_descendants() {
    let _trace = trace();
    FINISH_ORDER.lock().unwrap().clear();

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let t_child = ctx.create_template(finish_child, 1, 0).unwrap();
    let t_parent = ctx.create_template(finish_parent, 1, 0).unwrap();
    let t_gate = ctx.create_template(finish_gate, 0, 1).unwrap();

    let (_f, f_out) = ctx
        .create_edt(
            t_parent,
            &[t_child.bits()],
            &[],
            EdtProps::FINISH,
            None,
            true,
        )
        .unwrap();
    assert!(!f_out.is_null());
    ctx.create_edt(t_gate, &[], &[f_out], EdtProps::empty(), None, false)
        .unwrap();

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);

    let order = FINISH_ORDER.lock().unwrap().clone();
    assert_eq!(order[0], 'F');
    let z_pos = order.iter().position(|&c| c == 'Z').unwrap();
    assert!(order.iter().position(|&c| c == 'X').unwrap() < z_pos);
    assert!(order.iter().position(|&c| c == 'Y').unwrap() < z_pos);
    assert_eq!(order.iter().filter(|&&c| c == 'Z').count(), 1);

    ctx.destroy_event(f_out).unwrap();
    for guid in [t_child, t_parent, t_gate] {
        ctx.destroy_template(guid).unwrap();
    }
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- latch counting ---

static LATCH_RUNS: AtomicU32 = AtomicU32::new(0);
static LATCH_GATE_RUNS: AtomicU32 = AtomicU32::new(0);

fn latch_worker(ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    LATCH_RUNS.fetch_add(1, Ordering::Relaxed);
    ctx.satisfy_slot(Guid::from_bits(paramv[0]), Guid::NULL, LATCH_SLOT_DECR)
        .unwrap();
    Guid::NULL
}

fn latch_gate(ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[DepItem]) -> Guid {
    LATCH_GATE_RUNS.fetch_add(1, Ordering::Relaxed);
    assert_eq!(LATCH_RUNS.load(Ordering::Relaxed), 5);
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn latch_fires_after_all_decrements() {
    let _trace = trace();
    LATCH_RUNS.store(0, Ordering::Relaxed);
    LATCH_GATE_RUNS.store(0, Ordering::Relaxed);

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let latch = ctx.create_event(EventKind::Latch).unwrap();
    for _ in 0..5 {
        ctx.satisfy_slot(latch, Guid::NULL, LATCH_SLOT_INCR).unwrap();
    }

    let t_gate = ctx.create_template(latch_gate, 0, 1).unwrap();
    ctx.create_edt(t_gate, &[], &[latch], EdtProps::empty(), None, false)
        .unwrap();

    let t_worker = ctx.create_template(latch_worker, 1, 0).unwrap();
    for _ in 0..5 {
        ctx.create_edt(t_worker, &[latch.bits()], &[], EdtProps::empty(), None, false)
            .unwrap();
    }

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);
    assert_eq!(LATCH_RUNS.load(Ordering::Relaxed), 5);
    assert_eq!(LATCH_GATE_RUNS.load(Ordering::Relaxed), 1);

    // The latch self-destroyed when it fired.
    assert_eq!(
        ctx.event_get(latch).unwrap_err(),
        RuntimeError::InvalidGuid
    );

    for guid in [t_gate, t_worker] {
        ctx.destroy_template(guid).unwrap();
    }
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- pure control dependence ---

static CONTROL_RUNS: AtomicU32 = AtomicU32::new(0);

fn control_edt(ctx: &EdtContext<'_>, _paramv: &[u64], depv: &[DepItem]) -> Guid {
    assert_eq!(depv.len(), 1);
    assert!(depv[0].guid.is_null());
    assert!(depv[0].ptr.is_null());
    CONTROL_RUNS.fetch_add(1, Ordering::Relaxed);
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn pure_control_dependence() {
    let _trace = trace();
    CONTROL_RUNS.store(0, Ordering::Relaxed);

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let template = ctx.create_template(control_edt, 0, 1).unwrap();
    let (other, _) = ctx
        .create_edt(template, &[], &[], EdtProps::empty(), None, false)
        .unwrap();
    ctx.add_dependence(Guid::NULL, other, 0, AccessMode::Null)
        .unwrap();

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);
    assert_eq!(CONTROL_RUNS.load(Ordering::Relaxed), 1);

    ctx.destroy_template(template).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- datablock sharing ---

fn db_writer(_ctx: &EdtContext<'_>, _paramv: &[u64], depv: &[DepItem]) -> Guid {
    assert_eq!(depv.len(), 1);
    assert_eq!(depv[0].size, 1024);
    // Safety: the runtime acquired the block RW for this task; nobody else
    // writes it concurrently in this graph.
    let bytes = unsafe { std::slice::from_raw_parts_mut(depv[0].ptr, 1024) };
    for (i, byte) in bytes.iter_mut().take(512).enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "byte pattern wraps")]
        let val = i as u8;
        *byte = val;
    }
    Guid::NULL
}

fn db_reader(ctx: &EdtContext<'_>, _paramv: &[u64], depv: &[DepItem]) -> Guid {
    assert_eq!(depv.len(), 2);
    let db = depv[1];
    // Safety: acquired read-only for this task; the writer completed first.
    let bytes = unsafe { std::slice::from_raw_parts(db.ptr, 1024) };
    for (i, byte) in bytes.iter().take(512).enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "byte pattern wraps")]
        let expected = i as u8;
        assert_eq!(*byte, expected);
    }
    ctx.free(db.guid).unwrap();
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn datablock_shared_between_tasks() {
    let _trace = trace();

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let (db, _) = ctx
        .create_datablock(
            1024,
            DbFlags::NO_ACQUIRE,
            HintRecord::default(),
            AccessMode::Rw,
        )
        .unwrap();

    let t_writer = ctx.create_template(db_writer, 0, 1).unwrap();
    let t_reader = ctx.create_template(db_reader, 0, 2).unwrap();

    let (writer, writer_out) = ctx
        .create_edt(t_writer, &[], &[], EdtProps::empty(), None, true)
        .unwrap();
    ctx.add_dependence(db, writer, 0, AccessMode::Rw).unwrap();

    let (reader, _) = ctx
        .create_edt(t_reader, &[], &[], EdtProps::empty(), None, false)
        .unwrap();
    ctx.add_dependence(writer_out, reader, 0, AccessMode::Null)
        .unwrap();
    ctx.add_dependence(db, reader, 1, AccessMode::Ro).unwrap();

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);

    // Freed by the reader once every acquirer released.
    assert_eq!(
        ctx.acquire(db, AccessMode::Ro).unwrap_err(),
        RuntimeError::InvalidGuid
    );

    ctx.destroy_event(writer_out).unwrap();
    for guid in [t_writer, t_reader] {
        ctx.destroy_template(guid).unwrap();
    }
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- duplicate sticky satisfy ---

static STICKY_SEEN: Mutex<Option<Guid>> = Mutex::new(None);

fn sticky_watcher(ctx: &EdtContext<'_>, _paramv: &[u64], depv: &[DepItem]) -> Guid {
    *STICKY_SEEN.lock().unwrap() = Some(depv[0].guid);
    ctx.shutdown(0).unwrap();
    Guid::NULL
}

#[test]
fn duplicate_sticky_satisfy_is_rejected() {
    let _trace = trace();
    *STICKY_SEEN.lock().unwrap() = None;

    let platform = single_domain();
    let ctx = EdtContext::new(platform.pd(0));

    let (d1, _) = ctx
        .create_datablock(8, DbFlags::NO_ACQUIRE, HintRecord::default(), AccessMode::Rw)
        .unwrap();
    let (d2, _) = ctx
        .create_datablock(8, DbFlags::NO_ACQUIRE, HintRecord::default(), AccessMode::Rw)
        .unwrap();

    let sticky = ctx.create_event(EventKind::Sticky).unwrap();
    let template = ctx.create_template(sticky_watcher, 0, 1).unwrap();
    ctx.create_edt(template, &[], &[sticky], EdtProps::empty(), None, false)
        .unwrap();

    ctx.satisfy(sticky, d1).unwrap();
    assert_eq!(
        ctx.satisfy(sticky, d2).unwrap_err(),
        RuntimeError::DuplicateSatisfy
    );

    let code = platform.run_until_shutdown(64).unwrap();
    assert_eq!(code, 0);
    assert_eq!(*STICKY_SEEN.lock().unwrap(), Some(d1));
    // An idempotent event would have swallowed the second satisfy instead.
    assert_eq!(ctx.event_get(sticky).unwrap(), d1);

    ctx.destroy_event(sticky).unwrap();
    ctx.destroy_template(template).unwrap();
    ctx.free(d1).unwrap();
    ctx.free(d2).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

// --- threaded smoke test ---

static THREADED_RUNS: AtomicU32 = AtomicU32::new(0);

fn threaded_step(ctx: &EdtContext<'_>, paramv: &[u64], _depv: &[DepItem]) -> Guid {
    let n = THREADED_RUNS.fetch_add(1, Ordering::AcqRel) + 1;
    if n == 32 {
        ctx.shutdown(7).unwrap();
    } else {
        let next = Guid::from_bits(paramv[0]);
        ctx.satisfy(next, Guid::NULL).unwrap();
    }
    Guid::NULL
}

#[test]
fn workers_drive_chain_to_shutdown() {
    let _trace = trace();
    THREADED_RUNS.store(0, Ordering::Relaxed);

    let platform = Platform::new(
        PlatformConfig::default()
            .with_topology(1, 2)
            .with_workers(2, 1),
    );
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let template = ctx.create_template(threaded_step, 1, 1).unwrap();
    let mut events = Vec::new();
    for _ in 0..32 {
        events.push(ctx.create_event(EventKind::Sticky).unwrap());
    }
    for i in 0..32 {
        let next = if i + 1 < 32 {
            events[i + 1]
        } else {
            Guid::NULL
        };
        let affinity = u32::try_from(i % 2).unwrap();
        ctx.create_edt(
            template,
            &[next.bits()],
            &[events[i]],
            EdtProps::empty(),
            Some(affinity),
            false,
        )
        .unwrap();
    }

    let handles = tress::spawn_workers(&platform);
    ctx.satisfy(events[0], Guid::NULL).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(THREADED_RUNS.load(Ordering::Relaxed), 32);
    assert_eq!(platform.pd(0).shutdown_code(), 7);

    for event in events {
        ctx.destroy_event(event).unwrap();
    }
    ctx.destroy_template(template).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}
