//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use grid_session::{
    LocalRegion, RegionShortcut, SessionConfig, SessionEvent, SessionRepository, Topology,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client topology through a PROXY region, swept at `sweep`.
pub fn client_config(sweep: Duration) -> SessionConfig {
    SessionConfig::default().with_sweep_interval(sweep)
}

/// Data-holding peer, eligible for native expiration.
pub fn peer_config() -> SessionConfig {
    SessionConfig::default()
        .with_topology(Topology::Peer)
        .with_server_shortcut(RegionShortcut::Partition)
}

/// A peer repository over a region the test can drive directly.
///
/// The region evictor is slowed down so that expiration happens only when
/// the test calls `expire_idle_entries`.
pub async fn peer_with_region(config: SessionConfig) -> (SessionRepository, Arc<LocalRegion>) {
    let region = Arc::new(
        LocalRegion::new(config.region_name.clone()).with_eviction_interval(Duration::from_secs(3600)),
    );
    let repo = SessionRepository::builder(config)
        .with_region(region.clone())
        .start()
        .await
        .expect("repository starts");
    (repo, region)
}

/// Everything published so far.
pub fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::kind).collect()
}
