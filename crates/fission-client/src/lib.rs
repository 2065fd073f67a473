//! fission-client — HTTP clients between Fission components.
//!
//! # Components
//!
//! - **`http`** — [`HttpClient`], a small HTTP/1 client over hyper with
//!   per-request timeouts and optional connection reuse
//! - **`executor`** — [`ExecutorClient`], used by the router to obtain
//!   function addresses and to report traffic (tap) back to the executor
//! - **`fetcher`** — [`FetcherClient`] for the fetcher sidecar in runtime
//!   and builder pods
//! - **`builder`** — [`BuilderClient`] for an environment's builder container

pub mod builder;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod http;

pub use builder::{BuildRequest, BuildResponse, BuilderClient};
pub use error::{ClientError, ClientResult};
pub use executor::{ExecutorClient, TapServiceRequest};
pub use fetcher::{
    ArchiveUploadRequest, ArchiveUploadResponse, FetchRequest, FetchType, FetcherClient, LoadRequest,
    SpecializeRequest,
};
pub use http::{HttpClient, HttpResponse};
