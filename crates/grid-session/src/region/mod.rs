//! The backing store contract.
//!
//! A [`Region`] is a named key-value collection of [`SessionState`] keyed by
//! [`SessionId`], as offered by the data grid. The repository talks to it only
//! through this trait, so that the data-holding ([`local::LocalRegion`]) and
//! client proxy ([`proxy::ProxyRegion`]) topologies look the same from above.
//!
//! Writes are checked optimistically against the version the caller last
//! saw; the store assigns a new version on every accepted write.

pub mod local;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::AttributeDelta;
use crate::error::Result;
use crate::index::{IndexDefinition, QueryField};
use crate::record::{SessionId, SessionRecord, SessionState};

/// What the store does with an entry whose idle timeout elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationAction {
    /// Drop the value but keep the key until the next eviction pass; no old
    /// value is read back.
    #[default]
    Invalidate,
    /// Remove the entry, delivering the old value with the event.
    Destroy,
}

impl std::fmt::Display for ExpirationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpirationAction::Invalidate => write!(f, "invalidate"),
            ExpirationAction::Destroy => write!(f, "destroy"),
        }
    }
}

/// Native entry idle-timeout settings of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationAttributes {
    /// Zero disables native expiration.
    pub timeout: TimeDelta,
    pub action: ExpirationAction,
}

impl ExpirationAttributes {
    /// Expire entries idle for `timeout`, applying `action`.
    pub fn new(timeout: TimeDelta, action: ExpirationAction) -> Self {
        Self { timeout, action }
    }

    /// No native expiration.
    pub fn disabled() -> Self {
        Self::new(TimeDelta::zero(), ExpirationAction::default())
    }

    /// Whether entries expire at all.
    pub fn is_enabled(&self) -> bool {
        self.timeout > TimeDelta::zero()
    }
}

impl Default for ExpirationAttributes {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Result of an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No value existed under the key before this write.
    Created { version: u64 },
    /// An existing value was replaced.
    Updated { version: u64 },
}

impl PutOutcome {
    /// Version assigned by the write.
    pub fn version(&self) -> u64 {
        match self {
            PutOutcome::Created { version } | PutOutcome::Updated { version } => *version,
        }
    }

    /// Whether the write created the entry.
    pub fn is_created(&self) -> bool {
        matches!(self, PutOutcome::Created { .. })
    }
}

/// A partial update: the attribute changes and metadata of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDelta {
    pub id: SessionId,
    pub expected_version: u64,
    pub last_accessed_time: DateTime<Utc>,
    pub max_inactive_interval_ms: i64,
    pub principal_name: Option<String>,
    pub attributes: AttributeDelta,
}

impl SessionDelta {
    /// The pending changes of a previously stored record, or `None` if it was never stored.
    pub fn from_record(record: &SessionRecord) -> Option<Self> {
        Some(Self {
            id: record.id().clone(),
            expected_version: record.version()?,
            last_accessed_time: record.last_accessed_time(),
            max_inactive_interval_ms: record.max_inactive_interval().num_milliseconds(),
            principal_name: record.principal_name().map(str::to_string),
            attributes: record.delta().clone(),
        })
    }

    /// Apply this delta to a stored state.
    pub fn apply_to(&self, state: &mut SessionState) {
        self.attributes.apply_to(&mut state.attributes);
        state.last_accessed_time = self.last_accessed_time.max(state.creation_time);
        state.max_inactive_interval_ms = self.max_inactive_interval_ms;
        state.principal_name = self.principal_name.clone();
    }
}

/// Kind of change reported by a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionEventKind {
    Created,
    Updated,
    Destroyed,
    Invalidated,
}

/// Cause of a region change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// An explicit operation by a region user.
    Application,
    /// The region's own idle-timeout mechanism.
    Expiration,
}

/// A change to one region entry.
#[derive(Debug, Clone)]
pub struct RegionEvent {
    pub kind: RegionEventKind,
    pub origin: EventOrigin,
    pub key: SessionId,
    /// Previous value; only delivered by destroys.
    pub old_value: Option<SessionState>,
}

impl RegionEvent {
    /// Event without an old value.
    pub fn new(kind: RegionEventKind, origin: EventOrigin, key: SessionId) -> Self {
        Self {
            kind,
            origin,
            key,
            old_value: None,
        }
    }

    /// Attach the value the entry held before the change.
    pub fn with_old_value(mut self, old_value: SessionState) -> Self {
        self.old_value = Some(old_value);
        self
    }

    /// Whether the entry was removed by the region's idle timeout.
    pub fn is_expiration(&self) -> bool {
        self.origin == EventOrigin::Expiration
            && matches!(
                self.kind,
                RegionEventKind::Destroyed | RegionEventKind::Invalidated
            )
    }
}

/// Receives region changes. Called after the region released its locks.
pub trait RegionListener: Send + Sync {
    fn on_event(&self, event: &RegionEvent);
}

/// Handle for unregistering a [`RegionListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Key-value store holding session state.
#[async_trait]
pub trait Region: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`Region::put_delta`] is supported.
    fn supports_partial_update(&self) -> bool {
        false
    }

    /// Whether entry idle-timeout expiration can be configured on this region.
    fn supports_native_expiration(&self) -> bool {
        false
    }

    /// Read an entry. Counts as access for idle-timeout purposes.
    async fn get(&self, id: &SessionId) -> Result<Option<SessionState>>;

    /// Read an entry without counting as access.
    async fn peek(&self, id: &SessionId) -> Result<Option<SessionState>>;

    /// All valid entries, without counting as access.
    async fn entries(&self) -> Result<Vec<SessionState>>;

    /// Write a full entry.
    ///
    /// When a valid value exists, `expected_version` must equal its version
    /// or the write fails with [`Error::Concurrency`](crate::Error::Concurrency).
    /// Writing to an absent (or invalidated) key always creates it.
    async fn put(&self, state: SessionState, expected_version: Option<u64>) -> Result<PutOutcome>;

    /// Apply a partial update. Returns `Ok(None)` when there is no valid
    /// value to update, leaving the caller to write the full state.
    async fn put_delta(&self, _delta: &SessionDelta) -> Result<Option<PutOutcome>> {
        Ok(None)
    }

    /// Remove an entry. Returns whether a valid value was removed.
    async fn remove(&self, id: &SessionId) -> Result<bool>;

    /// Set the native idle-timeout expiration of the region.
    async fn configure_expiration(&self, attributes: ExpirationAttributes) -> Result<()>;

    /// Create a named index. Returns `false` if an identical index already existed.
    async fn create_index(&self, definition: &IndexDefinition) -> Result<bool>;

    /// Valid entries whose `field` equals `value`.
    async fn query(&self, field: &QueryField, value: &str) -> Result<Vec<SessionState>>;

    fn register_listener(&self, listener: Arc<dyn RegionListener>) -> ListenerId;

    /// Returns whether the listener was registered.
    fn unregister_listener(&self, id: ListenerId) -> bool;
}
