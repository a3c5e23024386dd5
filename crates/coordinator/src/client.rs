//! Pooled backend-RPC clients with reopen-once retry support.
//!
//! Contract:
//! - every checkout returns to the pool on all exit paths (the handle checks
//!   itself back in on drop);
//! - a transport failure entitles the call site to exactly one `reopen` +
//!   retry; a reopened handle replaces the broken connection in place;
//! - transport failures surface as `KiteError::Transport`, logical failures
//!   arrive inside the returned [`ExecStatus`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kite_common::error::Result;
use kite_common::ids::{HostPort, UniqueId};
use kite_common::status::ExecStatus;
use tracing::debug;

use crate::wire::ExecFragmentRequest;

/// One connection to a backend service.
#[async_trait]
pub trait BackendClient: Send {
    /// Starts a fragment instance on the backend.
    ///
    /// `Err(Transport)` means the request may not have reached the backend;
    /// `Ok(status)` is the backend's logical reply.
    async fn exec_plan_fragment(&mut self, request: &ExecFragmentRequest) -> Result<ExecStatus>;

    /// Cancels a fragment instance on the backend.
    async fn cancel_plan_fragment(&mut self, instance_id: UniqueId) -> Result<ExecStatus>;
}

/// Opens backend connections; injected so tests can script transports.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Opens a fresh connection to `host`.
    async fn connect(&self, host: &HostPort) -> Result<Box<dyn BackendClient>>;
}

struct CacheInner {
    connector: Arc<dyn BackendConnector>,
    idle: Mutex<HashMap<HostPort, Vec<Box<dyn BackendClient>>>>,
}

/// Process-wide pool of idle backend connections, keyed by endpoint.
/// Cheap-clone handle over shared state.
#[derive(Clone)]
pub struct ClientCache {
    inner: Arc<CacheInner>,
}

impl ClientCache {
    /// Creates a pool over the given connector.
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connector,
                idle: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Checks out a connection to `host`, opening one when the pool is empty.
    pub async fn client(&self, host: &HostPort) -> Result<ClientHandle> {
        let pooled = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(host)
            .and_then(Vec::pop);
        let client = match pooled {
            Some(client) => client,
            None => {
                debug!(host = %host, operator = "ClientCache", "opening backend connection");
                self.inner.connector.connect(host).await?
            }
        };
        Ok(ClientHandle {
            cache: self.clone(),
            host: host.clone(),
            client: Some(client),
        })
    }

    fn checkin(&self, host: HostPort, client: Box<dyn BackendClient>) {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host)
            .or_default()
            .push(client);
    }

    /// Idle connections currently pooled for `host`.
    pub fn idle_count(&self, host: &HostPort) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .map_or(0, Vec::len)
    }
}

/// Checked-out connection; returns to the pool on drop.
pub struct ClientHandle {
    cache: ClientCache,
    host: HostPort,
    client: Option<Box<dyn BackendClient>>,
}

impl ClientHandle {
    /// Replaces a broken connection with a freshly opened one.
    pub async fn reopen(&mut self) -> Result<()> {
        debug!(host = %self.host, operator = "ClientCache", "reopening backend connection");
        let fresh = self.cache.inner.connector.connect(&self.host).await?;
        self.client = Some(fresh);
        Ok(())
    }

    fn client_mut(&mut self) -> &mut dyn BackendClient {
        self.client
            .as_mut()
            .expect("client present until drop")
            .as_mut()
    }

    /// See [`BackendClient::exec_plan_fragment`].
    pub async fn exec_plan_fragment(
        &mut self,
        request: &ExecFragmentRequest,
    ) -> Result<ExecStatus> {
        self.client_mut().exec_plan_fragment(request).await
    }

    /// See [`BackendClient::cancel_plan_fragment`].
    pub async fn cancel_plan_fragment(&mut self, instance_id: UniqueId) -> Result<ExecStatus> {
        self.client_mut().cancel_plan_fragment(instance_id).await
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.cache.checkin(self.host.clone(), client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnector {
        opened: AtomicUsize,
    }

    struct NoopClient;

    #[async_trait]
    impl BackendClient for NoopClient {
        async fn exec_plan_fragment(&mut self, _: &ExecFragmentRequest) -> Result<ExecStatus> {
            Ok(ExecStatus::ok())
        }

        async fn cancel_plan_fragment(&mut self, _: UniqueId) -> Result<ExecStatus> {
            Ok(ExecStatus::ok())
        }
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        async fn connect(&self, _: &HostPort) -> Result<Box<dyn BackendClient>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NoopClient))
        }
    }

    #[tokio::test]
    async fn dropped_handles_return_to_the_pool() {
        let connector = Arc::new(CountingConnector {
            opened: AtomicUsize::new(0),
        });
        let cache = ClientCache::new(connector.clone());
        let host = HostPort::new("10.0.0.1", 21000);

        let handle = cache.client(&host).await.expect("client");
        drop(handle);
        assert_eq!(cache.idle_count(&host), 1);

        // second checkout reuses the pooled connection
        let _handle = cache.client(&host).await.expect("client");
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reopen_replaces_the_connection() {
        let connector = Arc::new(CountingConnector {
            opened: AtomicUsize::new(0),
        });
        let cache = ClientCache::new(connector.clone());
        let host = HostPort::new("10.0.0.1", 21000);

        let mut handle = cache.client(&host).await.expect("client");
        handle.reopen().await.expect("reopen");
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        drop(handle);
        assert_eq!(cache.idle_count(&host), 1);
    }
}
