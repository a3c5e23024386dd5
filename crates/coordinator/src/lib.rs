//! Per-query control plane of the Kite distributed query engine.
//!
//! Architecture role:
//! - assigns execution sites to plan-fragment instances and distributes scan
//!   ranges across them;
//! - dispatches instances to remote backends over RPC, running the root
//!   fragment locally when it is unpartitioned;
//! - aggregates status reports, runtime profiles, and progress;
//! - coordinates cancellation under failure and finalizes bulk-insert
//!   queries on the filesystem.
//!
//! Key modules:
//! - [`coordinator`]
//! - [`schedule`]
//! - [`backend_state`]
//! - [`profile`]
//! - [`client`]
//! - [`finalize`]
//! - `grpc` (feature-gated)
//!
//! Feature flags:
//! - `grpc`: enables tonic-generated RPC services and client/server glue.

pub mod backend_state;
pub mod client;
pub mod coordinator;
pub mod executor;
pub mod finalize;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod profile;
pub mod progress;
pub mod schedule;
pub mod wire;

pub use backend_state::BackendExecState;
pub use client::{BackendClient, BackendConnector, ClientCache, ClientHandle};
pub use coordinator::Coordinator;
pub use executor::{FragmentExecutor, FragmentExecutorFactory};
pub use finalize::{DistributedFs, LocalDfs};
pub use profile::{ProfileTree, RuntimeProfile};
pub use progress::{ExecStats, ProgressUpdater};
pub use schedule::{ClusterScheduler, ColocatedScheduler, FragmentExecParams, QuerySchedule};
pub use wire::{
    CatalogUpdate, ExecFragmentRequest, FragmentDestination, InsertExecStatus,
    ReportExecStatusRequest,
};
