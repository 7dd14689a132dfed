//! In-process region holding session data.
//!
//! [`LocalRegion`] plays the data-holding side of the grid: a peer member in
//! the peer topology, or the server tier behind a [`ProxyRegion`] in the
//! client topology. It supports partial updates, named indexes and native
//! entry idle-timeout expiration driven by its own evictor task.
//!
//! [`ProxyRegion`]: super::proxy::ProxyRegion

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{
    EventOrigin, ExpirationAction, ExpirationAttributes, ListenerId, PutOutcome, Region,
    RegionEvent, RegionEventKind, RegionListener, SessionDelta,
};
use crate::error::{Error, Result};
use crate::index::{IndexDefinition, QueryField};
use crate::record::{SessionId, SessionState};

/// Default interval between evictor passes.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(1);

/// One region entry. An invalidated entry keeps its key but has no value
/// until the next evictor pass drops it.
#[derive(Debug)]
struct Entry {
    state: Option<SessionState>,
    /// Last get or put, for idle timeout.
    accessed_at: DateTime<Utc>,
}

/// Postings of one named index.
#[derive(Debug)]
struct IndexState {
    definition: IndexDefinition,
    postings: HashMap<(QueryField, String), HashSet<SessionId>>,
}

impl IndexState {
    fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            postings: HashMap::new(),
        }
    }

    fn insert(&mut self, state: &SessionState) {
        for field in self.definition.expression.fields() {
            if let Some(value) = field.extract(state) {
                self.postings
                    .entry((field, value))
                    .or_default()
                    .insert(state.id.clone());
            }
        }
    }

    fn remove(&mut self, state: &SessionState) {
        for field in self.definition.expression.fields() {
            if let Some(value) = field.extract(state) {
                let key = (field, value);
                if let Some(ids) = self.postings.get_mut(&key) {
                    ids.remove(&state.id);
                    if ids.is_empty() {
                        self.postings.remove(&key);
                    }
                }
            }
        }
    }

    fn lookup(&self, field: &QueryField, value: &str) -> Vec<SessionId> {
        self.postings
            .get(&(field.clone(), value.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct RegionData {
    entries: HashMap<SessionId, Entry>,
    indexes: HashMap<String, IndexState>,
    expiration: ExpirationAttributes,
    last_version: u64,
}

impl RegionData {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    /// Drop the keys of invalidated entries. Returns how many were dropped.
    fn purge_invalidated(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.state.is_some());
        before - self.entries.len()
    }

    fn valid_state(&self, id: &SessionId) -> Option<&SessionState> {
        self.entries.get(id).and_then(|e| e.state.as_ref())
    }

    fn unindex(&mut self, state: &SessionState) {
        for index in self.indexes.values_mut() {
            index.remove(state);
        }
    }

    fn index(&mut self, state: &SessionState) {
        for index in self.indexes.values_mut() {
            index.insert(state);
        }
    }
}

struct Shared {
    name: String,
    data: RwLock<RegionData>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn RegionListener>)>>,
    next_listener_id: AtomicU64,
}

impl Shared {
    fn dispatch(&self, events: &[RegionEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn RegionListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for event in events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }

    /// Apply the expiration action to every entry idle past its timeout.
    ///
    /// Keys invalidated by an earlier pass are dropped first.
    fn expire_idle_entries(&self, now: DateTime<Utc>) -> usize {
        let events = {
            let mut data = self.data.write();
            let purged = data.purge_invalidated();
            if purged > 0 {
                trace!(region = %self.name, count = purged, "Dropped invalidated keys");
            }
            let attributes = data.expiration;
            if !attributes.is_enabled() {
                return 0;
            }

            let idle: Vec<SessionId> = data
                .entries
                .iter()
                .filter_map(|(id, entry)| {
                    let state = entry.state.as_ref()?;
                    let timeout = state.max_inactive_interval();
                    (timeout > TimeDelta::zero() && now - entry.accessed_at > timeout)
                        .then(|| id.clone())
                })
                .collect();

            let mut events = Vec::with_capacity(idle.len());
            for id in idle {
                let old = match attributes.action {
                    ExpirationAction::Invalidate => data
                        .entries
                        .get_mut(&id)
                        .and_then(|entry| entry.state.take()),
                    ExpirationAction::Destroy => {
                        data.entries.remove(&id).and_then(|entry| entry.state)
                    }
                };
                let Some(old) = old else { continue };
                data.unindex(&old);

                let event = match attributes.action {
                    ExpirationAction::Invalidate => {
                        RegionEvent::new(RegionEventKind::Invalidated, EventOrigin::Expiration, id)
                    }
                    ExpirationAction::Destroy => {
                        RegionEvent::new(RegionEventKind::Destroyed, EventOrigin::Expiration, id)
                            .with_old_value(old)
                    }
                };
                events.push(event);
            }
            events
        };

        if !events.is_empty() {
            debug!(region = %self.name, count = events.len(), "Expired idle entries");
        }
        self.dispatch(&events);
        events.len()
    }
}

/// Data-holding session region.
pub struct LocalRegion {
    shared: Arc<Shared>,
    eviction_interval: Duration,
    evictor: Mutex<Option<CancellationToken>>,
}

impl LocalRegion {
    /// Empty region named `name`, with native expiration disabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                data: RwLock::new(RegionData::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
            evictor: Mutex::new(None),
        }
    }

    /// Set how often the evictor looks for idle entries.
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.shared
            .data
            .read()
            .entries
            .values()
            .filter(|e| e.state.is_some())
            .count()
    }

    /// Whether the region holds no valid entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` has a key in the region, valid or not yet purged after invalidation.
    pub fn contains_key(&self, id: &SessionId) -> bool {
        self.shared.data.read().entries.contains_key(id)
    }

    /// Current native expiration settings.
    pub fn expiration_attributes(&self) -> ExpirationAttributes {
        self.shared.data.read().expiration
    }

    /// Names of the indexes defined on the region, sorted.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.data.read().indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one expiration pass as of `now`. Returns the number of entries expired.
    ///
    /// The evictor task calls this periodically; it is public so that the pass
    /// can be driven explicitly.
    pub fn expire_idle_entries(&self, now: DateTime<Utc>) -> usize {
        self.shared.expire_idle_entries(now)
    }

    /// Stop the evictor task, if running.
    pub fn close(&self) {
        if let Some(token) = self.evictor.lock().take() {
            token.cancel();
            info!(region = %self.shared.name, "Region evictor stopped");
        }
    }

    fn start_evictor(&self) {
        let mut evictor = self.evictor.lock();
        if evictor.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                region = %self.shared.name,
                "No async runtime, idle entries expire only when driven explicitly"
            );
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let interval = self.eviction_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.expire_idle_entries(Utc::now());
                    }
                }
            }
        });

        info!(
            region = %self.shared.name,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Region evictor started"
        );
        *evictor = Some(token);
    }
}

impl Drop for LocalRegion {
    fn drop(&mut self) {
        if let Some(token) = self.evictor.get_mut().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for LocalRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegion")
            .field("name", &self.shared.name)
            .field("len", &self.len())
            .field("eviction_interval", &self.eviction_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Region for LocalRegion {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn supports_partial_update(&self) -> bool {
        true
    }

    fn supports_native_expiration(&self) -> bool {
        true
    }

    async fn get(&self, id: &SessionId) -> Result<Option<SessionState>> {
        let mut data = self.shared.data.write();
        let Some(entry) = data.entries.get_mut(id) else {
            return Ok(None);
        };
        if entry.state.is_some() {
            entry.accessed_at = Utc::now();
        }
        trace!(region = %self.shared.name, session_id = %id, hit = entry.state.is_some(), "get");
        Ok(entry.state.clone())
    }

    async fn peek(&self, id: &SessionId) -> Result<Option<SessionState>> {
        Ok(self.shared.data.read().valid_state(id).cloned())
    }

    async fn entries(&self) -> Result<Vec<SessionState>> {
        Ok(self
            .shared
            .data
            .read()
            .entries
            .values()
            .filter_map(|e| e.state.clone())
            .collect())
    }

    async fn put(&self, mut state: SessionState, expected_version: Option<u64>) -> Result<PutOutcome> {
        let (outcome, event) = {
            let mut data = self.shared.data.write();
            let id = state.id.clone();

            let previous = match data.valid_state(&id) {
                Some(current) if expected_version != Some(current.version) => {
                    return Err(Error::Concurrency {
                        id,
                        expected: expected_version,
                        actual: Some(current.version),
                    });
                }
                Some(current) => Some(current.clone()),
                None => None,
            };
            if let Some(previous) = &previous {
                data.unindex(previous);
            }

            state.version = data.next_version();
            let outcome = if previous.is_some() {
                PutOutcome::Updated {
                    version: state.version,
                }
            } else {
                PutOutcome::Created {
                    version: state.version,
                }
            };

            data.index(&state);
            data.entries.insert(
                id.clone(),
                Entry {
                    state: Some(state),
                    accessed_at: Utc::now(),
                },
            );

            let kind = if outcome.is_created() {
                RegionEventKind::Created
            } else {
                RegionEventKind::Updated
            };
            (outcome, RegionEvent::new(kind, EventOrigin::Application, id))
        };

        trace!(region = %self.shared.name, session_id = %event.key, ?outcome, "put");
        self.shared.dispatch(std::slice::from_ref(&event));
        Ok(outcome)
    }

    async fn put_delta(&self, delta: &SessionDelta) -> Result<Option<PutOutcome>> {
        let outcome = {
            let mut data = self.shared.data.write();
            let Some(current) = data.valid_state(&delta.id) else {
                return Ok(None);
            };
            if current.version != delta.expected_version {
                return Err(Error::Concurrency {
                    id: delta.id.clone(),
                    expected: Some(delta.expected_version),
                    actual: Some(current.version),
                });
            }

            let mut state = current.clone();
            data.unindex(&state);
            delta.apply_to(&mut state);
            state.version = data.next_version();
            data.index(&state);

            let version = state.version;
            data.entries.insert(
                delta.id.clone(),
                Entry {
                    state: Some(state),
                    accessed_at: Utc::now(),
                },
            );
            PutOutcome::Updated { version }
        };

        trace!(
            region = %self.shared.name,
            session_id = %delta.id,
            changed = delta.attributes.len(),
            "put_delta"
        );
        self.shared.dispatch(&[RegionEvent::new(
            RegionEventKind::Updated,
            EventOrigin::Application,
            delta.id.clone(),
        )]);
        Ok(Some(outcome))
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        let old = {
            let mut data = self.shared.data.write();
            let old = data.entries.remove(id).and_then(|e| e.state);
            if let Some(old) = &old {
                data.unindex(old);
            }
            old
        };

        trace!(region = %self.shared.name, session_id = %id, removed = old.is_some(), "remove");
        match old {
            Some(old) => {
                self.shared.dispatch(&[RegionEvent::new(
                    RegionEventKind::Destroyed,
                    EventOrigin::Application,
                    id.clone(),
                )
                .with_old_value(old)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn configure_expiration(&self, attributes: ExpirationAttributes) -> Result<()> {
        {
            let mut data = self.shared.data.write();
            data.expiration = attributes;
            // No evictor pass will come by to drop them.
            if !attributes.is_enabled() {
                data.purge_invalidated();
            }
        }
        debug!(
            region = %self.shared.name,
            timeout_ms = attributes.timeout.num_milliseconds(),
            action = %attributes.action,
            "Configured entry idle timeout"
        );
        if attributes.is_enabled() {
            self.start_evictor();
        } else {
            self.close();
        }
        Ok(())
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<bool> {
        let mut data = self.shared.data.write();
        if let Some(existing) = data.indexes.get(&definition.name) {
            if existing.definition == *definition {
                return Ok(false);
            }
            return Err(Error::IndexCreation {
                name: definition.name.clone(),
                reason: format!(
                    "an index with expression {} already exists",
                    existing.definition.expression
                ),
            });
        }

        let mut index = IndexState::new(definition.clone());
        for state in data.entries.values().filter_map(|e| e.state.as_ref()) {
            index.insert(state);
        }
        data.indexes.insert(definition.name.clone(), index);
        Ok(true)
    }

    async fn query(&self, field: &QueryField, value: &str) -> Result<Vec<SessionState>> {
        let data = self.shared.data.read();
        let indexed = data
            .indexes
            .values()
            .find(|index| index.definition.expression.covers(field));

        let results: Vec<SessionState> = match indexed {
            Some(index) => index
                .lookup(field, value)
                .iter()
                .filter_map(|id| data.valid_state(id).cloned())
                .collect(),
            None => data
                .entries
                .values()
                .filter_map(|e| e.state.as_ref())
                .filter(|state| field.extract(state).as_deref() == Some(value))
                .cloned()
                .collect(),
        };

        trace!(
            region = %self.shared.name,
            field = %field,
            indexed = indexed.is_some(),
            matches = results.len(),
            "query"
        );
        Ok(results)
    }

    fn register_listener(&self, listener: Arc<dyn RegionListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push((id, listener));
        id
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}
