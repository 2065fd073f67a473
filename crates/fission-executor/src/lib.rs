//! fission-executor — turns a function into a serving address.
//!
//! # Components
//!
//! - **`executor`** — [`Executor`], the lookup loop: probe the kind's cache,
//!   validate the hit, otherwise create through the dispatcher
//! - **`dispatcher`** — single-flight creation per function revision
//! - **`kind`** — [`ExecutorKind`], tagged dispatch over the three strategies
//! - **`poolmgr`** — warm environment pools, specialization, pool admission
//! - **`deploy`** — one deployment and service per function (`newdeploy`,
//!   `container`)
//! - **`specializer`** — the fetch + load call that loads code into a pod
//! - **`reaper`**, **`watch`** — idle reaping and catalog reactions
//! - **`api`** — the HTTP surface the router talks to

pub mod api;
pub mod context;
pub mod deploy;
pub mod dispatcher;
pub mod executor;
pub mod kind;
pub mod poolmgr;
pub mod reaper;
pub mod specializer;
pub mod watch;

pub use api::build_router;
pub use context::ExecutorContext;
pub use deploy::DeployManager;
pub use dispatcher::{Dispatcher, Outcome};
pub use executor::Executor;
pub use kind::{ExecutorKind, Executors};
pub use poolmgr::{GenericPool, GenericPoolManager};
pub use specializer::{FetcherSpecializer, SpecializeFuture, Specializer};
