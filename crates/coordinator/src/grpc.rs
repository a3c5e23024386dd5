//! gRPC glue between the coordinator and backend executors.
//!
//! RPC schema source: `proto/kite_coordinator.proto`.
//!
//! Surface:
//! - [`GrpcBackendConnector`] opens `BackendService` channels and implements
//!   the client-pool seams ([`crate::client::BackendConnector`]);
//! - [`CoordinatorCallbackService`] serves `ReportExecStatus` and forwards
//!   each report into [`Coordinator::update_fragment_exec_status`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kite_common::config::CoordinatorSettings;
use kite_common::error::{KiteError, Result};
use kite_common::ids::{HostPort, UniqueId};
use kite_common::status::{ExecStatus, StatusCode};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::client::{BackendClient, BackendConnector};
use crate::coordinator::Coordinator;
use crate::wire::{ExecFragmentRequest, ReportExecStatusRequest};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("kite.coordinator.v1");
}

pub use v1::backend_service_client::BackendServiceClient;
pub use v1::backend_service_server::{BackendService, BackendServiceServer};
pub use v1::coordinator_callback_client::CoordinatorCallbackClient;
pub use v1::coordinator_callback_server::{CoordinatorCallback, CoordinatorCallbackServer};

fn status_to_proto(status: &ExecStatus) -> v1::StatusProto {
    v1::StatusProto {
        code: match status.code {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Error => 2,
        },
        error_msgs: status.error_msgs.clone(),
    }
}

fn proto_to_status(proto: Option<v1::StatusProto>) -> ExecStatus {
    let Some(proto) = proto else {
        return ExecStatus::ok();
    };
    ExecStatus {
        code: match proto.code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            _ => StatusCode::Error,
        },
        error_msgs: proto.error_msgs,
    }
}

/// Opens backend channels with the process's RPC timeouts.
pub struct GrpcBackendConnector {
    settings: CoordinatorSettings,
}

impl GrpcBackendConnector {
    /// Builds a connector from process settings.
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BackendConnector for GrpcBackendConnector {
    async fn connect(&self, host: &HostPort) -> Result<Box<dyn BackendClient>> {
        debug!(host = %host, operator = "GrpcBackendConnector", "connecting backend channel");
        let endpoint = format!("http://{}:{}", host.ipaddress, host.port)
            .parse::<tonic::transport::Endpoint>()
            .map_err(|err| KiteError::Transport(format!("invalid endpoint {host}: {err}")))?
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_millis(self.settings.rpc_timeout_ms))
            .connect_timeout(Duration::from_millis(self.settings.rpc_connect_timeout_ms));
        let channel = endpoint
            .connect()
            .await
            .map_err(|err| KiteError::Transport(format!("connect to {host} failed: {err}")))?;
        Ok(Box::new(GrpcBackendClient {
            client: BackendServiceClient::new(channel),
        }))
    }
}

struct GrpcBackendClient {
    client: BackendServiceClient<Channel>,
}

#[async_trait]
impl BackendClient for GrpcBackendClient {
    async fn exec_plan_fragment(&mut self, request: &ExecFragmentRequest) -> Result<ExecStatus> {
        let payload_json = serde_json::to_vec(request).map_err(|err| {
            KiteError::Internal(format!("encode ExecFragmentRequest failed: {err}"))
        })?;
        let reply = self
            .client
            .exec_plan_fragment(v1::ExecPlanFragmentRequest { payload_json })
            .await
            .map_err(|err| KiteError::Transport(format!("ExecPlanFragment rpc failed: {err}")))?;
        Ok(proto_to_status(reply.into_inner().status))
    }

    async fn cancel_plan_fragment(&mut self, instance_id: UniqueId) -> Result<ExecStatus> {
        let reply = self
            .client
            .cancel_plan_fragment(v1::CancelPlanFragmentRequest {
                instance_hi: instance_id.hi,
                instance_lo: instance_id.lo,
            })
            .await
            .map_err(|err| {
                KiteError::Transport(format!("CancelPlanFragment rpc failed: {err}"))
            })?;
        Ok(proto_to_status(reply.into_inner().status))
    }
}

/// `CoordinatorCallback` service backed by one query's coordinator.
#[derive(Clone)]
pub struct CoordinatorCallbackService {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorCallbackService {
    /// Builds the callback service over a shared coordinator.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl CoordinatorCallback for CoordinatorCallbackService {
    async fn report_exec_status(
        &self,
        request: Request<v1::ReportExecStatusRequest>,
    ) -> std::result::Result<Response<v1::ReportExecStatusResponse>, Status> {
        let report: ReportExecStatusRequest =
            serde_json::from_slice(&request.into_inner().report_json).map_err(|err| {
                Status::invalid_argument(format!("invalid status report payload: {err}"))
            })?;
        let status = match self.coordinator.update_fragment_exec_status(report).await {
            Ok(()) => ExecStatus::ok(),
            Err(err) => ExecStatus::error(err.to_string()),
        };
        Ok(Response::new(v1::ReportExecStatusResponse {
            status: Some(status_to_proto(&status)),
        }))
    }
}
