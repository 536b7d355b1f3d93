// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coverage of the wider interface surface: waiter-list growth, event
//! chaining, channels, labeled GUIDs, hints, message routing and the SAL.

use core::sync::atomic::{AtomicU32, Ordering};
use tress::{
    DepItem, EdtContext, EdtProps, EventKind, Guid, GuidKind, HintRecord, LabeledProps, Locality,
    Message, Payload, Platform, PlatformConfig, RuntimeError,
};

fn quiesce(platform: &Platform) {
    let mut sweeps = 0;
    while platform.drive() {
        sweeps += 1;
        assert!(sweeps < 10_000, "platform failed to quiesce");
    }
}

static WAITER_RUNS: AtomicU32 = AtomicU32::new(0);

fn count_run(_ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[DepItem]) -> Guid {
    WAITER_RUNS.fetch_add(1, Ordering::Relaxed);
    Guid::NULL
}

#[test]
fn waiter_list_grows_past_initial_capacity() {
    WAITER_RUNS.store(0, Ordering::Relaxed);
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let sticky = ctx.create_event(EventKind::Sticky).unwrap();
    let template = ctx.create_template(count_run, 0, 1).unwrap();
    // More waiters than the initial capacity of the waiters datablock.
    for _ in 0..10 {
        ctx.create_edt(template, &[], &[sticky], EdtProps::empty(), None, false)
            .unwrap();
    }
    ctx.satisfy(sticky, Guid::NULL).unwrap();
    quiesce(&platform);
    assert_eq!(WAITER_RUNS.load(Ordering::Relaxed), 10);

    // Late registration on the satisfied event short-circuits.
    ctx.create_edt(template, &[], &[sticky], EdtProps::empty(), None, false)
        .unwrap();
    quiesce(&platform);
    assert_eq!(WAITER_RUNS.load(Ordering::Relaxed), 11);

    ctx.destroy_event(sticky).unwrap();
    ctx.destroy_template(template).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

#[test]
fn event_to_event_dependence_chains() {
    WAITER_RUNS.store(0, Ordering::Relaxed);
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let head = ctx.create_event(EventKind::Once).unwrap();
    let tail = ctx.create_event(EventKind::Sticky).unwrap();
    ctx.add_dependence(head, tail, 0, tress::AccessMode::Null)
        .unwrap();

    let (db, _) = ctx
        .create_datablock(
            16,
            tress::DbFlags::NO_ACQUIRE,
            HintRecord::default(),
            tress::AccessMode::Rw,
        )
        .unwrap();
    ctx.satisfy(head, db).unwrap();
    quiesce(&platform);

    // The payload propagated through the chain; the once event is gone.
    assert_eq!(ctx.event_get(tail).unwrap(), db);
    assert_eq!(ctx.event_get(head).unwrap_err(), RuntimeError::InvalidGuid);

    ctx.destroy_event(tail).unwrap();
    ctx.free(db).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

#[test]
fn channel_event_buffers_payloads_in_order() {
    WAITER_RUNS.store(0, Ordering::Relaxed);
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let channel = ctx.create_event(EventKind::Channel).unwrap();
    // Two satisfies with no waiter: both payloads queue up.
    ctx.satisfy(channel, Guid::NULL).unwrap();
    ctx.satisfy(channel, Guid::NULL).unwrap();

    let template = ctx.create_template(count_run, 0, 1).unwrap();
    for _ in 0..2 {
        ctx.create_edt(template, &[], &[channel], EdtProps::empty(), None, false)
            .unwrap();
    }
    quiesce(&platform);
    assert_eq!(WAITER_RUNS.load(Ordering::Relaxed), 2);

    // A third consumer waits until the next satisfy.
    ctx.create_edt(template, &[], &[channel], EdtProps::empty(), None, false)
        .unwrap();
    quiesce(&platform);
    assert_eq!(WAITER_RUNS.load(Ordering::Relaxed), 2);
    ctx.satisfy(channel, Guid::NULL).unwrap();
    quiesce(&platform);
    assert_eq!(WAITER_RUNS.load(Ordering::Relaxed), 3);

    ctx.destroy_event(channel).unwrap();
    ctx.destroy_template(template).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

#[test]
fn labeled_event_creation_and_collision() {
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let (start, stride) = ctx.guid_reserve(4, GuidKind::EventSticky).unwrap();
    assert_eq!(stride, 1);

    let created = ctx
        .create_event_labeled(EventKind::Sticky, start, LabeledProps::CHECK)
        .unwrap();
    assert_eq!(created, start);

    // The label resolves like any other event.
    ctx.satisfy(created, Guid::NULL).unwrap();
    assert_eq!(ctx.event_get(created).unwrap(), Guid::NULL);

    // A second CHECK create on the same label collides.
    assert_eq!(
        ctx.create_event_labeled(EventKind::Sticky, start, LabeledProps::CHECK)
            .unwrap_err(),
        RuntimeError::AlreadyExists
    );

    ctx.destroy_event(created).unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

#[test]
fn hints_round_trip_and_prescriptions() {
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    let event = ctx.create_event(EventKind::Sticky).unwrap();
    let hint = HintRecord {
        locality: Some(Locality::Near),
        affinity: Some(0),
    };
    ctx.hint_set(event, hint).unwrap();
    assert_eq!(ctx.hint_get(event).unwrap(), hint);
    // Unknown guids answer with the empty record.
    assert_eq!(ctx.hint_get(Guid::from_bits(0x12)).unwrap().locality, None);

    ctx.destroy_event(event).unwrap();
    platform.teardown().unwrap();
}

#[test]
fn messages_route_across_clusters() {
    let platform = Platform::new(PlatformConfig::default().with_topology(2, 2));
    platform.boot().unwrap();

    // From the last block of the second cluster to the root: block → local
    // cluster head → destination cluster head, three hops at most.
    let ctx = EdtContext::new(platform.pd(3));
    let remote_event = {
        let root_ctx = EdtContext::new(platform.pd(0));
        root_ctx.create_event(EventKind::Sticky).unwrap()
    };
    assert_eq!(remote_event.location(), 0);

    ctx.satisfy(remote_event, Guid::NULL).unwrap();
    assert_eq!(ctx.event_get(remote_event).unwrap(), Guid::NULL);

    let mut msg = Message::request(
        3,
        0,
        Payload::GuidInfo {
            guid: remote_event,
            out_kind: GuidKind::None,
            out_location: 0,
        },
    );
    platform.pd(3).process_message(&mut msg, true).unwrap();
    assert!(msg.hops <= 3);
    let Payload::GuidInfo { out_kind, .. } = msg.payload else {
        unreachable!()
    };
    assert_eq!(out_kind, GuidKind::EventSticky);

    EdtContext::new(platform.pd(0))
        .destroy_event(remote_event)
        .unwrap();
    assert_eq!(platform.outstanding_guids(), 0);
    platform.teardown().unwrap();
}

#[test]
fn sal_surface() {
    let platform = Platform::new(PlatformConfig::default());
    platform.boot().unwrap();
    let ctx = EdtContext::new(platform.pd(0));

    ctx.sal_print("hello from the runtime").unwrap();

    let mut msg = Message::request(0, 0, Payload::SalRead { out_byte: 0 });
    assert_eq!(
        platform.pd(0).process_message(&mut msg, true).unwrap_err(),
        RuntimeError::NotSupported
    );
    platform.teardown().unwrap();
}
