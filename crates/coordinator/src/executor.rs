//! Seam to the worker-side fragment executor, used for the local root.
//!
//! When fragment 0 is unpartitioned the coordinator runs it in-process to
//! stream results to the caller; everything behind `prepare`/`open`/
//! `get_next` belongs to the execution engine, not the control plane.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use kite_common::error::Result;

use crate::profile::RuntimeProfile;
use crate::wire::ExecFragmentRequest;

/// One in-process execution of a plan fragment.
///
/// Implementations are internally synchronized: `cancel` may be called from
/// any thread while another sits inside `get_next`.
#[async_trait]
pub trait FragmentExecutor: Send + Sync {
    /// Sets the fragment up; exchange nodes register with the stream manager
    /// here, so this must finish before upstream senders dispatch.
    async fn prepare(&self, request: ExecFragmentRequest) -> Result<()>;

    /// Starts execution; blocks until the fragment can produce.
    async fn open(&self) -> Result<()>;

    /// Pulls the next batch; `None` after the final batch.
    async fn get_next(&self) -> Result<Option<RecordBatch>>;

    /// Asynchronously tears the fragment down.
    fn cancel(&self);

    /// The executor's runtime profile.
    fn profile(&self) -> RuntimeProfile;

    /// Tmp-path moves recorded by a table sink; valid once `open` returned.
    fn files_to_move(&self) -> BTreeMap<String, String>;

    /// Rows appended per partition by a table sink; valid once `open`
    /// returned.
    fn num_appended_rows(&self) -> HashMap<String, i64>;

    /// Error lines accumulated by the fragment.
    fn error_log(&self) -> Vec<String>;
}

/// Creates local executors; injected so the control plane stays free of
/// engine dependencies.
pub trait FragmentExecutorFactory: Send + Sync {
    /// Creates an executor for one local fragment instance.
    fn create(&self) -> Arc<dyn FragmentExecutor>;
}
