use serde::{Deserialize, Serialize};

use crate::ids::HostPort;

/// Process-level settings handed to each query coordinator.
///
/// Nothing in the control plane reads process globals; the embedding server
/// builds one of these from its flags and passes it down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Host name reported to backends in dispatch payloads.
    pub hostname: String,
    /// Address backends use for status-report callbacks.
    pub ipaddress: String,
    /// Backend-service port of this process.
    pub backend_port: u16,
    /// Connect timeout for backend RPC channels, in milliseconds.
    pub rpc_connect_timeout_ms: u64,
    /// Per-request timeout for backend RPCs, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Progress log stride: log once per this many percentage points.
    pub progress_log_stride_percent: u8,
}

impl CoordinatorSettings {
    /// The callback endpoint sent to every dispatched instance.
    pub fn coordinator_endpoint(&self) -> HostPort {
        HostPort {
            hostname: self.hostname.clone(),
            ipaddress: self.ipaddress.clone(),
            port: self.backend_port,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            ipaddress: "127.0.0.1".to_string(),
            backend_port: 21000,
            rpc_connect_timeout_ms: 10_000,
            rpc_timeout_ms: 600_000,
            progress_log_stride_percent: 10,
        }
    }
}
