//! The in-memory session record and its persisted state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::AttributeDelta;
use crate::dirty::{DirtyPredicate, EqualsDirtyPredicate};

/// Value type of session attributes.
pub type AttributeValue = serde_json::Value;

/// Opaque, unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted form of a session, as held by a [`Region`](crate::region::Region).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: SessionId,
    pub creation_time: DateTime<Utc>,
    pub last_accessed_time: DateTime<Utc>,
    /// Idle timeout in milliseconds; zero or negative disables idle expiration.
    pub max_inactive_interval_ms: i64,
    pub attributes: HashMap<String, AttributeValue>,
    pub principal_name: Option<String>,
    /// Store-assigned version, bumped on every write.
    pub version: u64,
}

impl SessionState {
    /// Idle timeout as a duration.
    pub fn max_inactive_interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.max_inactive_interval_ms)
    }

    /// Idle-timeout check against `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_idle_expired(self.last_accessed_time, self.max_inactive_interval(), now)
    }
}

/// A session is expired iff its interval is positive and it has been idle longer than that.
pub(crate) fn is_idle_expired(
    last_accessed_time: DateTime<Utc>,
    max_inactive_interval: TimeDelta,
    now: DateTime<Utc>,
) -> bool {
    max_inactive_interval > TimeDelta::zero() && now - last_accessed_time > max_inactive_interval
}

/// One HTTP session as seen by the application.
///
/// Attribute writes go through the record's [`DirtyPredicate`]; the ones it
/// judges dirty are collected in an [`AttributeDelta`] until the next save.
/// Writing [`AttributeValue::Null`] is the same as removing the attribute.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    id: SessionId,
    /// Id the session was last stored under, set by [`SessionRecord::change_id`].
    previous_id: Option<SessionId>,
    /// Id whose entry is still stored although the session has moved off it.
    stale_id: Option<SessionId>,
    creation_time: DateTime<Utc>,
    last_accessed_time: DateTime<Utc>,
    max_inactive_interval: TimeDelta,
    attributes: HashMap<String, AttributeValue>,
    delta: AttributeDelta,
    principal_name: Option<String>,
    /// Timestamps or interval changed since the last save.
    metadata_dirty: bool,
    /// Version of the stored entry this record was read from or last written to.
    version: Option<u64>,
    dirty_predicate: Arc<dyn DirtyPredicate>,
}

impl SessionRecord {
    /// Create a new, never-saved session with a fresh id.
    pub fn new(max_inactive_interval: TimeDelta) -> Self {
        Self::with_id(SessionId::generate(), max_inactive_interval)
    }

    /// Create a new, never-saved session with the given id.
    pub fn with_id(id: SessionId, max_inactive_interval: TimeDelta) -> Self {
        let now = Utc::now();
        Self {
            id,
            previous_id: None,
            stale_id: None,
            creation_time: now,
            last_accessed_time: now,
            max_inactive_interval,
            attributes: HashMap::new(),
            delta: AttributeDelta::new(),
            principal_name: None,
            metadata_dirty: false,
            version: None,
            dirty_predicate: Arc::new(EqualsDirtyPredicate),
        }
    }

    /// Rebuild a record from its stored state. The result has no pending changes.
    pub fn from_state(state: SessionState) -> Self {
        let max_inactive_interval = state.max_inactive_interval();
        Self {
            id: state.id,
            previous_id: None,
            stale_id: None,
            creation_time: state.creation_time,
            last_accessed_time: state.last_accessed_time.max(state.creation_time),
            max_inactive_interval,
            attributes: state.attributes,
            delta: AttributeDelta::new(),
            principal_name: state.principal_name,
            metadata_dirty: false,
            version: Some(state.version),
            dirty_predicate: Arc::new(EqualsDirtyPredicate),
        }
    }

    /// Snapshot the full state for storage. `version` is left for the store to assign.
    pub fn to_state(&self) -> SessionState {
        SessionState {
            id: self.id.clone(),
            creation_time: self.creation_time,
            last_accessed_time: self.last_accessed_time,
            max_inactive_interval_ms: self.max_inactive_interval.num_milliseconds(),
            attributes: self.attributes.clone(),
            principal_name: self.principal_name.clone(),
            version: self.version.unwrap_or(0),
        }
    }

    /// Replace the dirty predicate consulted by attribute writes.
    pub fn with_dirty_predicate(mut self, predicate: Arc<dyn DirtyPredicate>) -> Self {
        self.dirty_predicate = predicate;
        self
    }

    /// The current session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The id this session is still stored under, if it was rotated since the last save.
    pub fn previous_id(&self) -> Option<&SessionId> {
        self.previous_id.as_ref()
    }

    /// Rotate the session id, returning the new one.
    ///
    /// The state moves to the new id on the next save and the entry under the
    /// old id is removed.
    pub fn change_id(&mut self) -> SessionId {
        let new_id = SessionId::generate();
        let old_id = std::mem::replace(&mut self.id, new_id.clone());
        if self.previous_id.is_none() && self.version.is_some() {
            self.previous_id = Some(old_id);
        }
        new_id
    }

    /// When the session was created.
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// When the session was last accessed.
    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_accessed_time
    }

    /// Set the last access time. Values before the creation time are clamped to it.
    pub fn set_last_accessed_time(&mut self, time: DateTime<Utc>) {
        let time = time.max(self.creation_time);
        if time != self.last_accessed_time {
            self.last_accessed_time = time;
            self.metadata_dirty = true;
        }
    }

    /// Mark activity now.
    pub fn touch(&mut self) {
        self.set_last_accessed_time(Utc::now());
    }

    /// Idle timeout. Zero or negative never expires.
    pub fn max_inactive_interval(&self) -> TimeDelta {
        self.max_inactive_interval
    }

    /// Set the idle timeout.
    pub fn set_max_inactive_interval(&mut self, interval: TimeDelta) {
        if interval != self.max_inactive_interval {
            self.max_inactive_interval = interval;
            self.metadata_dirty = true;
        }
    }

    /// Idle-timeout check against the current time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Idle-timeout check against `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_idle_expired(self.last_accessed_time, self.max_inactive_interval, now)
    }

    /// Get an attribute value.
    pub fn get_attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// All attributes.
    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }

    /// Attribute names, sorted.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write an attribute, recording it in the delta if the predicate says it is dirty.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        if value.is_null() {
            self.remove_attribute(&key);
            return;
        }

        if self
            .dirty_predicate
            .is_dirty(self.attributes.get(&key), Some(&value))
        {
            self.delta.record_set(key.clone(), value.clone());
        }
        self.attributes.insert(key, value);
    }

    /// Remove an attribute, leaving a tombstone in the delta if the predicate says it is dirty.
    pub fn remove_attribute(&mut self, key: &str) -> Option<AttributeValue> {
        if self.dirty_predicate.is_dirty(self.attributes.get(key), None) {
            self.delta.record_removal(key);
        }
        self.attributes.remove(key)
    }

    /// Attribute changes pending since the last save.
    pub fn delta(&self) -> &AttributeDelta {
        &self.delta
    }

    /// Whether anything needs to be written on the next save.
    pub fn has_changes(&self) -> bool {
        self.version.is_none()
            || self.previous_id.is_some()
            || self.stale_id.is_some()
            || self.metadata_dirty
            || !self.delta.is_empty()
    }

    /// Never written to the store.
    pub fn is_new(&self) -> bool {
        self.version.is_none()
    }

    /// Store version this record was read at or last written as.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Principal name resolved at the last save.
    pub fn principal_name(&self) -> Option<&str> {
        self.principal_name.as_deref()
    }

    pub(crate) fn set_principal_name(&mut self, principal_name: Option<String>) {
        self.principal_name = principal_name;
    }

    /// Clear pending changes after the store accepted a write at `version`.
    ///
    /// A previous id becomes stale: the session is stored under its new id,
    /// but the old entry is not removed yet.
    pub(crate) fn commit(&mut self, version: u64) {
        self.delta.clear();
        self.metadata_dirty = false;
        if let Some(previous_id) = self.previous_id.take() {
            self.stale_id = Some(previous_id);
        }
        self.version = Some(version);
    }

    /// Old id whose entry still has to be removed.
    pub(crate) fn stale_id(&self) -> Option<&SessionId> {
        self.stale_id.as_ref()
    }

    pub(crate) fn clear_stale_id(&mut self) {
        self.stale_id = None;
    }
}
