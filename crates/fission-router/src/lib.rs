//! fission-router — HTTP entry point for function invocations.
//!
//! # Components
//!
//! - **`triggerset`** — [`TriggerSet`], rebuilds the route table whenever
//!   triggers or functions change
//! - **`route`** — [`RouteTable`] and the swappable [`MutableRouter`]
//! - **`resolver`** — trigger function references to function records,
//!   including weighted (canary) sets
//! - **`handler`** — [`FunctionHandler`], address lookup and the retrying
//!   proxy; [`ExecutorApi`] is the seam to the executor
//! - **`funcmap`**, **`throttler`** — address cache and lookup collapsing
//!   for the non-pool executors
//! - **`server`** — the axum app

pub mod funcmap;
pub mod handler;
pub mod resolver;
pub mod route;
pub mod server;
pub mod throttler;
pub mod triggerset;

pub use funcmap::FunctionServiceMap;
pub use handler::{ExecutorApi, ExecutorFuture, FunctionHandler, HandlerContext};
pub use resolver::{FunctionResolver, Resolved, TriggerRef};
pub use route::{MutableRouter, RouteTable};
pub use server::{build_router, start};
pub use throttler::Throttler;
pub use triggerset::{SyncStats, TriggerSet};
