// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Randomized dependence graphs: arbitrary task shapes, event kinds and
//! satisfaction orders across two policy domains must always drain, run
//! every task exactly once and return every count to zero.

use core::sync::atomic::{AtomicU32, Ordering};
use proptest::prelude::*;
use tress::{
    DepItem, EdtContext, EdtProps, EventKind, Guid, Platform, PlatformConfig,
};

static EXECUTED: AtomicU32 = AtomicU32::new(0);

fn counting_edt(_ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[DepItem]) -> Guid {
    EXECUTED.fetch_add(1, Ordering::Relaxed);
    Guid::NULL
}

/// Task shapes (dependence counts), per-slot event kinds and a shuffled
/// satisfaction order.
fn graphs() -> impl Strategy<Value = (Vec<u32>, Vec<u8>, Vec<usize>)> {
    proptest::collection::vec(1u32..4, 1..10).prop_flat_map(|depcs| {
        let total = depcs.iter().sum::<u32>() as usize;
        let order: Vec<usize> = (0..total).collect();
        (
            Just(depcs),
            proptest::collection::vec(0u8..3, total),
            Just(order).prop_shuffle(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_graphs_drain_and_balance((depcs, kinds, order) in graphs()) {
        EXECUTED.store(0, Ordering::Relaxed);

        let platform = Platform::new(PlatformConfig::default().with_topology(1, 2));
        platform.boot().unwrap();
        let ctx = EdtContext::new(platform.pd(0));

        // One template per distinct dependence count.
        let mut templates = std::collections::BTreeMap::new();
        for depc in &depcs {
            templates
                .entry(*depc)
                .or_insert_with(|| ctx.create_template(counting_edt, 0, *depc).unwrap());
        }

        // One event per dependence slot, of a random kind, wired through
        // add-dependence; tasks spread over both domains.
        let mut events = Vec::new();
        let mut persistent = Vec::new();
        for (i, depc) in depcs.iter().enumerate() {
            let affinity = u32::try_from(i % 2).unwrap();
            let (edt, _) = ctx
                .create_edt(
                    templates[depc],
                    &[],
                    &[],
                    EdtProps::empty(),
                    Some(affinity),
                    false,
                )
                .unwrap();
            for slot in 0..*depc {
                let kind = match kinds[events.len()] {
                    0 => EventKind::Once,
                    1 => EventKind::Sticky,
                    _ => EventKind::Idem,
                };
                let event = ctx.create_event(kind).unwrap();
                ctx.add_dependence(event, edt, slot, tress::AccessMode::Null)
                    .unwrap();
                events.push(event);
                if kind != EventKind::Once {
                    persistent.push(event);
                }
            }
        }

        // Satisfy every slot exactly once, in the shuffled order, driving
        // the platform in between so parked work interleaves with new
        // satisfactions.
        for (n, idx) in order.iter().enumerate() {
            ctx.satisfy(events[*idx], Guid::NULL).unwrap();
            if n % 3 == 0 {
                platform.drive();
            }
        }

        // Bounded quiescence: the graph must drain without outside help.
        let mut sweeps = 0;
        while platform.drive() {
            sweeps += 1;
            prop_assert!(sweeps < 10_000, "platform failed to quiesce");
        }

        prop_assert_eq!(
            EXECUTED.load(Ordering::Relaxed) as usize,
            depcs.len(),
            "every task runs exactly once"
        );

        // Once events self-destroyed; everything else is torn down here,
        // after which no allocation may remain.
        for event in persistent {
            ctx.destroy_event(event).unwrap();
        }
        for template in templates.values() {
            ctx.destroy_template(*template).unwrap();
        }
        prop_assert_eq!(platform.outstanding_guids(), 0);
        platform.teardown().unwrap();
    }
}
