// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker threads. Each worker belongs to exactly one policy domain and
//! cooperatively executes ready tasks and drains micro-task strands of its
//! work class until shutdown.

use crate::policy::{Platform, PolicyDomain};
use std::sync::Arc;
use std::thread::JoinHandle;
use strand_table::{WorkClass, WorkerId};

/// A worker bound to one policy domain.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    class: WorkClass,
    pd: Arc<PolicyDomain>,
    rng: fastrand::Rng,
}

impl Worker {
    #[must_use]
    pub fn new(pd: Arc<PolicyDomain>, id: WorkerId, class: WorkClass) -> Self {
        let rng = fastrand::Rng::with_seed(u64::from(id) | (u64::from(pd.location()) << 32));
        Self { id, class, pd, rng }
    }

    /// Runs until the owning domain observes a shutdown request, then makes
    /// a final pass so nothing is stranded in the tables.
    pub fn run(&mut self) {
        tracing::debug!(
            location = self.pd.location(),
            id = self.id,
            class = ?self.class,
            "worker up"
        );
        while !self.pd.shutdown_requested() {
            let progress = self.pd.worker_tick(self.id, self.class, Some(&mut self.rng));
            if !progress {
                std::thread::yield_now();
            }
        }
        // Drain the backlog so teardown finds quiescent tables.
        while self.pd.worker_tick(self.id, self.class, Some(&mut self.rng)) {}
        tracing::debug!(location = self.pd.location(), id = self.id, "worker down");
    }
}

/// Spawns the configured worker complement for every policy domain.
/// The caller joins the handles after shutdown.
#[must_use]
pub fn spawn_workers(platform: &Arc<Platform>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for pd in platform.domains() {
        let config = platform.config();
        for id in 0..config.workers_per_domain {
            let pd = Arc::clone(pd);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("worker-{}-{id}", pd.location()))
                    .spawn(move || Worker::new(pd, id, WorkClass::Work).run())
                    .expect("spawning worker thread"),
            );
        }
        for id in 0..config.comm_workers_per_domain {
            let pd = Arc::clone(pd);
            let worker_id = config.workers_per_domain + id;
            handles.push(
                std::thread::Builder::new()
                    .name(format!("comm-{}-{id}", pd.location()))
                    .spawn(move || Worker::new(pd, worker_id, WorkClass::Comm).run())
                    .expect("spawning comm worker thread"),
            );
        }
    }
    handles
}
