//! Region data policies and deployment topology.

use serde::{Deserialize, Serialize};

/// Data policy of a client-side region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRegionShortcut {
    Local,
    LocalHeapLru,
    LocalOverflow,
    LocalPersistent,
    LocalPersistentOverflow,
    /// No local state; every operation goes to the servers.
    #[default]
    Proxy,
    CachingProxy,
    CachingProxyHeapLru,
    CachingProxyOverflow,
}

impl ClientRegionShortcut {
    /// Keeps data only in the client, never talking to servers.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            ClientRegionShortcut::Local
                | ClientRegionShortcut::LocalHeapLru
                | ClientRegionShortcut::LocalOverflow
                | ClientRegionShortcut::LocalPersistent
                | ClientRegionShortcut::LocalPersistentOverflow
        )
    }

    /// Keeps no local state.
    pub fn is_proxy(self) -> bool {
        matches!(self, ClientRegionShortcut::Proxy)
    }
}

/// Data policy of a peer or server-side region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionShortcut {
    Local,
    LocalPersistent,
    #[default]
    Partition,
    PartitionRedundant,
    PartitionPersistent,
    PartitionRedundantPersistentOverflow,
    PartitionProxy,
    PartitionProxyRedundant,
    Replicate,
    ReplicatePersistent,
    ReplicateProxy,
}

impl RegionShortcut {
    /// Keeps no local state.
    pub fn is_proxy(self) -> bool {
        matches!(
            self,
            RegionShortcut::PartitionProxy
                | RegionShortcut::PartitionProxyRedundant
                | RegionShortcut::ReplicateProxy
        )
    }
}

/// How this process reaches the session region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// A member of the data grid holding (or able to hold) region data itself.
    Peer,
    /// A client connected to a server tier through a connection pool.
    #[default]
    Client,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Peer => write!(f, "peer"),
            Topology::Client => write!(f, "client"),
        }
    }
}

/// Whether native entry expiration can be configured for the region this
/// process sees: a client needs local state, a peer needs a data-holding policy.
pub fn is_expiration_allowed(
    topology: Topology,
    client_shortcut: ClientRegionShortcut,
    server_shortcut: RegionShortcut,
) -> bool {
    match topology {
        Topology::Client => !client_shortcut.is_proxy(),
        Topology::Peer => !server_shortcut.is_proxy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_expiration_allowed() {
        assert!(is_expiration_allowed(
            Topology::Client,
            ClientRegionShortcut::CachingProxy,
            RegionShortcut::PartitionProxy
        ));
        assert!(is_expiration_allowed(
            Topology::Client,
            ClientRegionShortcut::LocalPersistentOverflow,
            RegionShortcut::Replicate
        ));
    }

    #[test]
    fn test_server_expiration_allowed() {
        assert!(is_expiration_allowed(
            Topology::Peer,
            ClientRegionShortcut::Proxy,
            RegionShortcut::Replicate
        ));
        assert!(is_expiration_allowed(
            Topology::Peer,
            ClientRegionShortcut::Local,
            RegionShortcut::PartitionRedundantPersistentOverflow
        ));
    }

    #[test]
    fn test_client_expiration_not_allowed() {
        assert!(!is_expiration_allowed(
            Topology::Client,
            ClientRegionShortcut::Proxy,
            RegionShortcut::PartitionProxy
        ));
        assert!(!is_expiration_allowed(
            Topology::Client,
            ClientRegionShortcut::Proxy,
            RegionShortcut::Replicate
        ));
    }

    #[test]
    fn test_server_expiration_not_allowed() {
        assert!(!is_expiration_allowed(
            Topology::Peer,
            ClientRegionShortcut::Proxy,
            RegionShortcut::PartitionProxy
        ));
        assert!(!is_expiration_allowed(
            Topology::Peer,
            ClientRegionShortcut::Local,
            RegionShortcut::ReplicateProxy
        ));
    }

    #[test]
    fn test_shortcut_names() {
        let s: ClientRegionShortcut = serde_json::from_str("\"CACHING_PROXY\"").unwrap();
        assert_eq!(s, ClientRegionShortcut::CachingProxy);
        let s: RegionShortcut = serde_json::from_str("\"PARTITION_PROXY_REDUNDANT\"").unwrap();
        assert!(s.is_proxy());
        assert!(ClientRegionShortcut::LocalHeapLru.is_local());
        assert!(!ClientRegionShortcut::CachingProxy.is_local());
    }
}
