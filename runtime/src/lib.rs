// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! tress: an event-driven tasking runtime core.
//!
//! All computation is expressed as tasks (EDTs) whose inputs are datablocks
//! gated by events and organized into dependency graphs. The crate provides
//! the distributed policy-domain message dispatcher, the event and
//! dependency resolution engine, the datablock acquisition protocol and,
//! through the [`strand-table`](strand_table) crate, the micro-task
//! continuation scheduler that drains deferred work once its events become
//! ready.
//!
//! A minimal embedding:
//!
//! ```
//! use tress::{EdtContext, EdtProps, EventKind, Guid, Platform, PlatformConfig};
//!
//! fn hello(ctx: &EdtContext<'_>, _paramv: &[u64], _depv: &[tress::DepItem]) -> Guid {
//!     ctx.shutdown(0).unwrap();
//!     Guid::NULL
//! }
//!
//! let platform = Platform::new(PlatformConfig::default());
//! platform.boot().unwrap();
//! let ctx = EdtContext::new(platform.pd(0));
//! let template = ctx.create_template(hello, 0, 1).unwrap();
//! let trigger = ctx.create_event(EventKind::Once).unwrap();
//! let (_edt, _) = ctx
//!     .create_edt(template, &[], &[trigger], EdtProps::empty(), None, false)
//!     .unwrap();
//! ctx.satisfy(trigger, Guid::NULL).unwrap();
//! platform.run_until_shutdown(16).unwrap();
//! platform.teardown().unwrap();
//! ```

mod api;
mod config;
mod datablock;
mod error;
mod event;
mod guid;
mod hint;
mod message;
mod policy;
mod runlevel;
mod task;
mod worker;

pub use api::EdtContext;
pub use config::{EventConfig, INIT_WAITER_COUNT, PlatformConfig};
pub use datablock::{AccessMode, Datablock, DbFlags, MAX_DB_USERS};
pub use error::RuntimeError;
pub use event::{EventKind, EventRecord, LATCH_SLOT_DECR, LATCH_SLOT_INCR};
pub use guid::{Guid, GuidKind, GuidObject, GuidProvider, LabeledProps, Location};
pub use hint::{HintRecord, Locality, prescription, prescription_levels};
pub use message::{Message, MessageProps, Payload};
pub use policy::{Platform, PolicyDomain};
pub use runlevel::{Runlevel, RunlevelProps, RunlevelState};
pub use task::{DepItem, Edt, EdtFn, EdtProps, EdtTemplate, ELS_SIZE, ELS_SLOT_FINISH_LATCH};
pub use worker::{Worker, spawn_workers};

pub use strand_table::{StrandTableConfig, WorkClass};
