//! Client-side proxy region.
//!
//! A [`ProxyRegion`] keeps no local state. Every operation is forwarded to the
//! data-holding region on the server tier, with session state crossing the
//! boundary as bytes produced by the configured [`SessionSerializer`]. Proxies
//! offer neither partial updates nor native expiration, so a repository in
//! front of one falls back to full writes and proactive sweeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use super::local::LocalRegion;
use super::{ExpirationAttributes, ListenerId, PutOutcome, Region, RegionListener};
use crate::error::{Error, Result};
use crate::index::{IndexDefinition, QueryField};
use crate::record::{SessionId, SessionState};
use crate::serializer::SessionSerializer;

/// Proxy to a server-side [`LocalRegion`] reached through a named pool.
#[derive(Debug)]
pub struct ProxyRegion {
    server: Arc<LocalRegion>,
    serializer: Arc<dyn SessionSerializer>,
    pool_name: String,
    connected: AtomicBool,
}

impl ProxyRegion {
    /// Proxy to `server` through the pool `pool_name`, shipping state with `serializer`.
    pub fn new(
        server: Arc<LocalRegion>,
        serializer: Arc<dyn SessionSerializer>,
        pool_name: impl Into<String>,
    ) -> Self {
        Self {
            server,
            serializer,
            pool_name: pool_name.into(),
            connected: AtomicBool::new(true),
        }
    }

    /// Name of the connection pool.
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Whether the pool currently reaches the server.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Simulate losing the connection pool. Operations fail until [`ProxyRegion::reconnect`].
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!(pool = %self.pool_name, region = %self.server.name(), "Proxy disconnected");
        }
    }

    /// Restore the connection after [`ProxyRegion::disconnect`].
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(pool = %self.pool_name, region = %self.server.name(), "Proxy reconnected");
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(format!(
                "pool {} cannot reach region {}",
                self.pool_name,
                self.server.name()
            )))
        }
    }

    /// Send `state` across the wire.
    fn ship(&self, state: &SessionState) -> Result<SessionState> {
        let bytes = self.serializer.serialize(state)?;
        self.serializer.deserialize(&bytes)
    }

    fn ship_all(&self, states: Vec<SessionState>) -> Result<Vec<SessionState>> {
        states.iter().map(|s| self.ship(s)).collect()
    }
}

#[async_trait]
impl Region for ProxyRegion {
    fn name(&self) -> &str {
        self.server.name()
    }

    async fn get(&self, id: &SessionId) -> Result<Option<SessionState>> {
        self.ensure_connected()?;
        match self.server.get(id).await? {
            Some(state) => Ok(Some(self.ship(&state)?)),
            None => Ok(None),
        }
    }

    async fn peek(&self, id: &SessionId) -> Result<Option<SessionState>> {
        self.ensure_connected()?;
        match self.server.peek(id).await? {
            Some(state) => Ok(Some(self.ship(&state)?)),
            None => Ok(None),
        }
    }

    async fn entries(&self) -> Result<Vec<SessionState>> {
        self.ensure_connected()?;
        let entries = self.server.entries().await?;
        self.ship_all(entries)
    }

    async fn put(&self, state: SessionState, expected_version: Option<u64>) -> Result<PutOutcome> {
        self.ensure_connected()?;
        let shipped = self.ship(&state)?;
        self.server.put(shipped, expected_version).await
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        self.ensure_connected()?;
        self.server.remove(id).await
    }

    async fn configure_expiration(&self, _attributes: ExpirationAttributes) -> Result<()> {
        Err(Error::Config(format!(
            "region {} is a client proxy and keeps no entries to expire",
            self.server.name()
        )))
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<bool> {
        self.ensure_connected()?;
        self.server.create_index(definition).await
    }

    async fn query(&self, field: &QueryField, value: &str) -> Result<Vec<SessionState>> {
        self.ensure_connected()?;
        let matches = self.server.query(field, value).await?;
        self.ship_all(matches)
    }

    fn register_listener(&self, listener: Arc<dyn RegionListener>) -> ListenerId {
        self.server.register_listener(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.server.unregister_listener(id)
    }
}
