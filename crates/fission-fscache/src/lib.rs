//! fission-fscache — where the executor keeps track of function services.
//!
//! # Components
//!
//! - **`funcsvc`** — [`FuncSvc`], one specialized, addressable instance of a
//!   function revision
//! - **`poolcache`** — [`PoolCache`], the admission serializer for pool-managed
//!   functions: per-revision groups of pod addresses with active-request
//!   counts, in-flight specializations and a FIFO of parked requests
//! - **`fscache`** — [`FunctionServiceCache`], one service per function
//!   revision for the deployment-backed executors, plus the pod index used
//!   by the pool manager
//!
//! Both caches are owned by a single worker task each; handles only send
//! requests and await replies, so no state is ever shared behind a lock.

pub mod fscache;
pub mod funcsvc;
pub mod poolcache;

pub use fscache::FunctionServiceCache;
pub use funcsvc::{FuncSvc, ObjectRef};
pub use poolcache::{Admission, GroupStats, PoolCache, SvcWait};
