//! Configuration for the session repository.
//!
//! [`SessionConfig`] is a plain value passed to
//! [`SessionRepositoryBuilder`](crate::SessionRepositoryBuilder). It can be
//! built in code with the `with_*` setters or loaded from TOML:
//!
//! ```toml
//! region_name = "ClusteredSessions"
//! topology = "peer"
//! server_shortcut = "REPLICATE"
//! max_inactive_interval_secs = 900
//! indexable_attributes = ["tenant"]
//!
//! [expiration]
//! action = "destroy"
//! sweep_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::dirty::DirtyPredicateKind;
use crate::error::{Error, Result};
use crate::index::PRINCIPAL_NAME_INDEX_NAME;
use crate::region::ExpirationAction;
use crate::serializer::SerializerKind;
use crate::topology::{ClientRegionShortcut, RegionShortcut, Topology};

/// Default name of the session region.
pub const DEFAULT_REGION_NAME: &str = "ClusteredSessions";

/// Default connection pool of the client topology.
pub const DEFAULT_POOL_NAME: &str = "DEFAULT";

/// Default idle timeout: 30 minutes.
pub const DEFAULT_MAX_INACTIVE_INTERVAL_SECS: i64 = 1800;

/// Default attribute holding a security context the principal can be read from.
pub const DEFAULT_SECURITY_CONTEXT_ATTRIBUTE: &str = "SECURITY_CONTEXT";

/// Default interval between proactive expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Expiration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Action the store applies to natively expired entries.
    pub action: ExpirationAction,

    /// Interval of the proactive sweep, used when native expiration is unavailable.
    pub sweep_interval_ms: u64,

    /// Expire sessions this long after creation, regardless of activity.
    pub fixed_duration_secs: Option<i64>,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            action: ExpirationAction::default(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            fixed_duration_secs: None,
        }
    }
}

/// Configuration for a [`SessionRepository`](crate::SessionRepository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub region_name: String,

    pub topology: Topology,

    /// Data policy of the region in the client topology.
    pub client_shortcut: ClientRegionShortcut,

    /// Data policy of the region on peers and servers.
    pub server_shortcut: RegionShortcut,

    /// Connection pool used by the client topology.
    pub pool_name: String,

    /// Idle timeout of new sessions. Zero or negative disables idle expiration.
    pub max_inactive_interval_secs: i64,

    /// Attributes covered by the session-attributes index.
    pub indexable_attributes: Vec<String>,

    /// Attribute whose string value is the session's principal name.
    pub principal_name_attribute: String,

    /// Attribute holding a security context, consulted when the principal attribute is absent.
    pub security_context_attribute: Option<String>,

    pub serializer: SerializerKind,

    pub dirty_predicate: DirtyPredicateKind,

    pub expiration: ExpirationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region_name: DEFAULT_REGION_NAME.to_string(),
            topology: Topology::default(),
            client_shortcut: ClientRegionShortcut::default(),
            server_shortcut: RegionShortcut::default(),
            pool_name: DEFAULT_POOL_NAME.to_string(),
            max_inactive_interval_secs: DEFAULT_MAX_INACTIVE_INTERVAL_SECS,
            indexable_attributes: Vec::new(),
            principal_name_attribute: PRINCIPAL_NAME_INDEX_NAME.to_string(),
            security_context_attribute: Some(DEFAULT_SECURITY_CONTEXT_ATTRIBUTE.to_string()),
            serializer: SerializerKind::default(),
            dirty_predicate: DirtyPredicateKind::default(),
            expiration: ExpirationConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Check the settings for values the repository cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.region_name.trim().is_empty() {
            return Err(Error::Config("region_name must not be empty".to_string()));
        }
        if self.topology == Topology::Client && self.pool_name.trim().is_empty() {
            return Err(Error::Config(
                "pool_name must not be empty in the client topology".to_string(),
            ));
        }
        if self.expiration.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "expiration.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if TimeDelta::try_seconds(self.max_inactive_interval_secs).is_none() {
            return Err(Error::Config(format!(
                "max_inactive_interval_secs {} is out of range",
                self.max_inactive_interval_secs
            )));
        }
        if let Some(secs) = self.expiration.fixed_duration_secs {
            if secs <= 0 {
                return Err(Error::Config(
                    "expiration.fixed_duration_secs must be positive".to_string(),
                ));
            }
            if TimeDelta::try_seconds(secs).is_none() {
                return Err(Error::Config(format!(
                    "expiration.fixed_duration_secs {secs} is out of range"
                )));
            }
        }
        if self.principal_name_attribute.is_empty() {
            return Err(Error::Config(
                "principal_name_attribute must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle timeout of new sessions. Out-of-range values saturate.
    pub fn max_inactive_interval(&self) -> TimeDelta {
        saturating_seconds(self.max_inactive_interval_secs)
    }

    /// Interval of the proactive sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiration.sweep_interval_ms)
    }

    /// Fixed session lifetime, if configured. Out-of-range values saturate.
    pub fn fixed_duration(&self) -> Option<TimeDelta> {
        self.expiration.fixed_duration_secs.map(saturating_seconds)
    }

    /// Set the region name.
    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.region_name = name.into();
        self
    }

    /// Set the topology.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the client region data policy.
    pub fn with_client_shortcut(mut self, shortcut: ClientRegionShortcut) -> Self {
        self.client_shortcut = shortcut;
        self
    }

    /// Set the peer and server region data policy.
    pub fn with_server_shortcut(mut self, shortcut: RegionShortcut) -> Self {
        self.server_shortcut = shortcut;
        self
    }

    /// Set the connection pool of the client topology.
    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Set the idle timeout of new sessions. Zero or negative never expires.
    pub fn with_max_inactive_interval_secs(mut self, secs: i64) -> Self {
        self.max_inactive_interval_secs = secs;
        self
    }

    /// Set the attributes covered by the session-attributes index.
    pub fn with_indexable_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexable_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the attribute holding the principal name.
    pub fn with_principal_name_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.principal_name_attribute = attribute.into();
        self
    }

    /// Set the security context attribute; `None` disables the fallback.
    pub fn with_security_context_attribute(mut self, attribute: Option<String>) -> Self {
        self.security_context_attribute = attribute;
        self
    }

    /// Set the wire format used by proxy regions.
    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the dirty predicate.
    pub fn with_dirty_predicate(mut self, predicate: DirtyPredicateKind) -> Self {
        self.dirty_predicate = predicate;
        self
    }

    /// Set the native expiration action.
    pub fn with_expiration_action(mut self, action: ExpirationAction) -> Self {
        self.expiration.action = action;
        self
    }

    /// Set the interval of the proactive sweep, at millisecond precision.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiration.sweep_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Expire sessions a fixed time after creation instead of after idling.
    pub fn with_fixed_duration_secs(mut self, secs: i64) -> Self {
        self.expiration.fixed_duration_secs = Some(secs);
        self
    }
}

fn saturating_seconds(secs: i64) -> TimeDelta {
    TimeDelta::try_seconds(secs).unwrap_or(if secs < 0 {
        TimeDelta::MIN
    } else {
        TimeDelta::MAX
    })
}
