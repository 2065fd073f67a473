//! fission-state — the resource catalog for Fission.
//!
//! Backed by [redb](https://docs.rs/redb), holds the Function, Environment,
//! Package, HTTPTrigger, ConfigMap and Secret catalogs and announces every
//! change on a broadcast watch stream.
//!
//! # Architecture
//!
//! Resources are JSON-serialized into redb's `&[u8]` value columns under
//! `{namespace}/{name}` keys, one table per kind. Writes assign the uid,
//! a store-wide monotonically increasing `resourceVersion`, and bump the
//! `generation` when the desired state changes.
//!
//! Components that would watch an orchestrator API (the router's trigger
//! set, the package watcher, the config-map refresher) subscribe to
//! [`StateStore::watch`] instead. Every committed write produces exactly one
//! [`CatalogEvent`], in commit order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod watch;

pub use error::{StateError, StateResult};
pub use store::{StateStore, Stored};
pub use watch::{CatalogEvent, Change};
