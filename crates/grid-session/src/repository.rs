//! The session repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::SessionConfig;
use crate::dirty::DirtyPredicate;
use crate::error::Result;
use crate::events::{SessionEvent, SessionEventBus};
use crate::expiration::{
    ExpirationEngine, ExpirationMode, ExpirationPolicy, Reaper, policy_from_config,
};
use crate::index::{IndexManager, PRINCIPAL_NAME_INDEX_NAME, PrincipalNameResolver};
use crate::record::{SessionId, SessionRecord, SessionState};
use crate::region::local::LocalRegion;
use crate::region::proxy::ProxyRegion;
use crate::region::{ListenerId, PutOutcome, Region, RegionEvent, RegionListener, SessionDelta};
use crate::topology::Topology;

/// Turns expiration-origin region events into [`SessionEvent::Expired`].
///
/// Application removals are ignored; the repository publishes those itself.
struct ExpirationBridge {
    events: SessionEventBus,
}

impl RegionListener for ExpirationBridge {
    fn on_event(&self, event: &RegionEvent) {
        if event.is_expiration() {
            debug!(session_id = %event.key, kind = ?event.kind, "Session expired by region");
            self.events.publish(SessionEvent::Expired {
                id: event.key.clone(),
            });
        }
    }
}

struct RepositoryInner {
    config: SessionConfig,
    region: Arc<dyn Region>,
    indexes: IndexManager,
    principal: PrincipalNameResolver,
    dirty_predicate: Arc<dyn DirtyPredicate>,
    expiration: ExpirationEngine,
    events: SessionEventBus,
    bridge: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

impl RepositoryInner {
    fn record_from_state(&self, state: SessionState) -> SessionRecord {
        SessionRecord::from_state(state).with_dirty_predicate(Arc::clone(&self.dirty_predicate))
    }

    /// Remove an expired session, publishing `Expired` only if this call removed it.
    async fn expire(&self, id: &SessionId) -> Result<bool> {
        let removed = self.region.remove(id).await?;
        if removed {
            debug!(session_id = %id, "Session expired");
            self.events.publish(SessionEvent::Expired { id: id.clone() });
        }
        Ok(removed)
    }
}

#[async_trait]
impl Reaper for RepositoryInner {
    async fn reap_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .region
            .entries()
            .await?
            .into_iter()
            .filter(|state| self.expiration.is_expired(state, now))
            .map(|state| state.id)
            .collect();

        let mut removed = 0;
        for id in &expired {
            // Another path may have removed it since the scan.
            if self.expire(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Builds a [`SessionRepository`].
///
/// Without an explicit region, one is created from the configured topology:
/// a [`LocalRegion`] for peers and client-local shortcuts, otherwise a
/// [`ProxyRegion`] in front of an in-process server region.
pub struct SessionRepositoryBuilder {
    config: SessionConfig,
    region: Option<Arc<dyn Region>>,
    dirty_predicate: Option<Arc<dyn DirtyPredicate>>,
    expiration_policy: Option<Arc<dyn ExpirationPolicy>>,
    events: Option<SessionEventBus>,
}

impl SessionRepositoryBuilder {
    /// Builder for a repository configured by `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            region: None,
            dirty_predicate: None,
            expiration_policy: None,
            events: None,
        }
    }

    /// Use an existing region instead of creating one.
    pub fn with_region(mut self, region: Arc<dyn Region>) -> Self {
        self.region = Some(region);
        self
    }

    /// Override the configured dirty predicate with a custom one.
    pub fn with_dirty_predicate(mut self, predicate: Arc<dyn DirtyPredicate>) -> Self {
        self.dirty_predicate = Some(predicate);
        self
    }

    /// Override the configured expiration policy with a custom one.
    pub fn with_expiration_policy(mut self, policy: Arc<dyn ExpirationPolicy>) -> Self {
        self.expiration_policy = Some(policy);
        self
    }

    /// Publish to an existing bus, e.g. one shared by several repositories.
    pub fn with_event_bus(mut self, events: SessionEventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn default_region(config: &SessionConfig) -> Arc<dyn Region> {
        match config.topology {
            Topology::Peer => Arc::new(LocalRegion::new(config.region_name.clone())),
            Topology::Client if config.client_shortcut.is_local() => {
                Arc::new(LocalRegion::new(config.region_name.clone()))
            }
            Topology::Client => {
                let server = Arc::new(LocalRegion::new(config.region_name.clone()));
                Arc::new(ProxyRegion::new(
                    server,
                    config.serializer.build(),
                    config.pool_name.clone(),
                ))
            }
        }
    }

    /// Validate the configuration, create the indexes and wire up expiration.
    ///
    /// Fails without serving anything if any index cannot be created.
    pub async fn start(self) -> Result<SessionRepository> {
        let config = self.config;
        config.validate()?;

        let region = self
            .region
            .unwrap_or_else(|| Self::default_region(&config));
        let indexes = IndexManager::from_config(&config)?;
        indexes.initialize(region.as_ref()).await?;

        let policy = self
            .expiration_policy
            .unwrap_or_else(|| policy_from_config(&config));
        let mode = ExpirationMode::resolve(&config, policy.as_ref(), region.as_ref());
        let events = self.events.unwrap_or_default();

        let inner = Arc::new(RepositoryInner {
            principal: PrincipalNameResolver::from_config(&config),
            dirty_predicate: self
                .dirty_predicate
                .unwrap_or_else(|| config.dirty_predicate.build()),
            expiration: ExpirationEngine::new(policy, mode),
            bridge: Mutex::new(None),
            closed: AtomicBool::new(false),
            region,
            indexes,
            events,
            config,
        });

        let bridge = inner.region.register_listener(Arc::new(ExpirationBridge {
            events: inner.events.clone(),
        }));
        *inner.bridge.lock() = Some(bridge);

        let reaper: Weak<dyn Reaper> = Arc::downgrade(&inner) as Weak<dyn Reaper>;
        if let Err(e) = inner.expiration.install(inner.region.as_ref(), reaper).await {
            inner.region.unregister_listener(bridge);
            return Err(e);
        }

        info!(
            region = %inner.region.name(),
            topology = %inner.config.topology,
            expiration = %mode,
            indexes = inner.indexes.definitions().len(),
            "Session repository started"
        );
        Ok(SessionRepository { inner })
    }
}

/// Session repository backed by a data-grid [`Region`].
///
/// Cloning is cheap and clones share everything, including the event bus
/// and the expiration sweep.
#[derive(Clone)]
pub struct SessionRepository {
    inner: Arc<RepositoryInner>,
}

impl SessionRepository {
    /// Builder for a repository configured by `config`.
    pub fn builder(config: SessionConfig) -> SessionRepositoryBuilder {
        SessionRepositoryBuilder::new(config)
    }

    /// Start a repository for `config` with its default region.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    /// The validated configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The backing region.
    pub fn region(&self) -> &Arc<dyn Region> {
        &self.inner.region
    }

    /// Bus lifecycle events are published on.
    pub fn events(&self) -> &SessionEventBus {
        &self.inner.events
    }

    /// How expired sessions are removed.
    pub fn expiration_mode(&self) -> ExpirationMode {
        self.inner.expiration.mode()
    }

    /// Indexes created at startup.
    pub fn indexes(&self) -> &IndexManager {
        &self.inner.indexes
    }

    /// A new, unsaved session with the default idle timeout.
    pub fn create_session(&self) -> SessionRecord {
        self.create_session_with_id(SessionId::generate())
    }

    /// A new, unsaved session under a caller-chosen id.
    pub fn create_session_with_id(&self, id: SessionId) -> SessionRecord {
        let record = SessionRecord::with_id(id, self.inner.config.max_inactive_interval())
            .with_dirty_predicate(Arc::clone(&self.inner.dirty_predicate));
        trace!(session_id = %record.id(), "Session created");
        record
    }

    /// Load a session and mark it accessed.
    ///
    /// An expired session is removed, reported as expired, and returned as `None`.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        let Some(state) = self.inner.region.get(id).await? else {
            trace!(session_id = %id, "Session not found");
            return Ok(None);
        };

        if self.inner.expiration.is_expired(&state, Utc::now()) {
            self.inner.expire(id).await?;
            return Ok(None);
        }

        let mut record = self.inner.record_from_state(state);
        record.touch();
        Ok(Some(record))
    }

    /// Persist pending changes of `record`.
    ///
    /// New sessions and rotated ids are written in full. Otherwise the delta is
    /// written when the region supports partial updates, else the full state
    /// with the version the record was read at. A record with nothing pending
    /// is not written at all.
    ///
    /// After an id change the entry under the old id is removed once the new
    /// one is stored. If that removal fails, the next save retries it.
    pub async fn save(&self, record: &mut SessionRecord) -> Result<()> {
        if !record.has_changes() {
            trace!(session_id = %record.id(), "Nothing to save");
            return Ok(());
        }

        self.remove_stale_id(record).await?;
        if !record.has_changes() {
            return Ok(());
        }

        let principal = self.inner.principal.resolve(record.attributes());
        record.set_principal_name(principal);
        let changed = record.delta().keys();

        let outcome = if record.is_new() || record.previous_id().is_some() {
            self.inner.region.put(record.to_state(), None).await?
        } else {
            self.write_existing(record).await?
        };

        record.commit(outcome.version());

        let event = if outcome.is_created() {
            debug!(session_id = %record.id(), version = outcome.version(), "Session stored");
            Some(SessionEvent::Created {
                id: record.id().clone(),
            })
        } else if !changed.is_empty() {
            trace!(session_id = %record.id(), keys = ?changed, "Session attributes saved");
            Some(SessionEvent::Changed {
                id: record.id().clone(),
                keys: changed,
            })
        } else {
            trace!(session_id = %record.id(), "Session access time saved");
            None
        };
        if let Some(event) = event {
            self.inner.events.publish(event);
        }

        self.remove_stale_id(record).await
    }

    /// Remove the entry left under the id a session was rotated away from.
    async fn remove_stale_id(&self, record: &mut SessionRecord) -> Result<()> {
        let Some(stale_id) = record.stale_id().cloned() else {
            return Ok(());
        };
        self.inner.region.remove(&stale_id).await?;
        record.clear_stale_id();
        debug!(
            session_id = %record.id(),
            previous_id = %stale_id,
            "Session id changed"
        );
        Ok(())
    }

    async fn write_existing(&self, record: &SessionRecord) -> Result<PutOutcome> {
        let region = &self.inner.region;
        if region.supports_partial_update() {
            if let Some(delta) = SessionDelta::from_record(record) {
                if let Some(outcome) = region.put_delta(&delta).await? {
                    return Ok(outcome);
                }
            }
            // The stored entry is gone; write the whole session back.
            return region.put(record.to_state(), None).await;
        }
        region.put(record.to_state(), record.version()).await
    }

    /// Rotate the id of `record`. Takes effect on the next save.
    pub fn change_session_id(&self, record: &mut SessionRecord) -> SessionId {
        let id = record.change_id();
        trace!(session_id = %id, "Session id rotated");
        id
    }

    /// Delete a session. Deleting an absent session is not an error.
    ///
    /// Returns whether this call removed it.
    pub async fn delete_by_id(&self, id: &SessionId) -> Result<bool> {
        let removed = self.inner.region.remove(id).await?;
        if removed {
            debug!(session_id = %id, "Session deleted");
            self.inner.events.publish(SessionEvent::Deleted { id: id.clone() });
        } else {
            trace!(session_id = %id, "Session already gone");
        }
        Ok(removed)
    }

    /// Sessions whose `index_name` field equals `value`.
    ///
    /// `index_name` is either [`PRINCIPAL_NAME_INDEX_NAME`] (or the configured
    /// principal attribute) or an attribute name. Expired matches are removed
    /// and left out. No match yields an empty map.
    pub async fn find_by_index_name_and_index_value(
        &self,
        index_name: &str,
        value: &str,
    ) -> Result<HashMap<SessionId, SessionRecord>> {
        let states = self
            .inner
            .indexes
            .find(self.inner.region.as_ref(), index_name, value)
            .await?;

        let now = Utc::now();
        let mut found = HashMap::with_capacity(states.len());
        for state in states {
            if self.inner.expiration.is_expired(&state, now) {
                self.inner.expire(&state.id).await?;
                continue;
            }
            found.insert(state.id.clone(), self.inner.record_from_state(state));
        }

        trace!(index = %index_name, matches = found.len(), "Index lookup");
        Ok(found)
    }

    /// Sessions of the user named `principal_name`.
    pub async fn find_by_principal_name(
        &self,
        principal_name: &str,
    ) -> Result<HashMap<SessionId, SessionRecord>> {
        self.find_by_index_name_and_index_value(PRINCIPAL_NAME_INDEX_NAME, principal_name)
            .await
    }

    /// Remove every expired session now. Returns how many were removed.
    pub async fn reap_expired(&self) -> Result<usize> {
        self.inner.reap_expired().await
    }

    /// Whether [`SessionRepository::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the expiration sweep and detach from region events. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.expiration.stop();
        if let Some(id) = self.inner.bridge.lock().take() {
            self.inner.region.unregister_listener(id);
        }
        info!(region = %self.inner.region.name(), "Session repository closed");
    }
}

impl std::fmt::Debug for SessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository")
            .field("region", &self.inner.region.name())
            .field("expiration", &self.inner.expiration.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::IdentityDirtyPredicate;
    use crate::error::Error;
    use crate::index::{IndexDefinition, QueryField};
    use crate::region::ExpirationAttributes;
    use crate::topology::RegionShortcut;
    use chrono::TimeDelta;
    use serde_json::json;

    /// Local region whose removes fail while `failing` is set.
    struct FailingRemoves {
        inner: LocalRegion,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Region for FailingRemoves {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn supports_partial_update(&self) -> bool {
            true
        }

        async fn get(&self, id: &SessionId) -> Result<Option<SessionState>> {
            self.inner.get(id).await
        }

        async fn peek(&self, id: &SessionId) -> Result<Option<SessionState>> {
            self.inner.peek(id).await
        }

        async fn entries(&self) -> Result<Vec<SessionState>> {
            self.inner.entries().await
        }

        async fn put(&self, state: SessionState, expected: Option<u64>) -> Result<PutOutcome> {
            self.inner.put(state, expected).await
        }

        async fn put_delta(&self, delta: &SessionDelta) -> Result<Option<PutOutcome>> {
            self.inner.put_delta(delta).await
        }

        async fn remove(&self, id: &SessionId) -> Result<bool> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable("remove rejected".to_string()));
            }
            self.inner.remove(id).await
        }

        async fn configure_expiration(&self, attributes: ExpirationAttributes) -> Result<()> {
            self.inner.configure_expiration(attributes).await
        }

        async fn create_index(&self, definition: &IndexDefinition) -> Result<bool> {
            self.inner.create_index(definition).await
        }

        async fn query(&self, field: &QueryField, value: &str) -> Result<Vec<SessionState>> {
            self.inner.query(field, value).await
        }

        fn register_listener(&self, listener: Arc<dyn RegionListener>) -> ListenerId {
            self.inner.register_listener(listener)
        }

        fn unregister_listener(&self, id: ListenerId) -> bool {
            self.inner.unregister_listener(id)
        }
    }

    fn peer() -> SessionConfig {
        SessionConfig::default()
            .with_topology(Topology::Peer)
            .with_server_shortcut(RegionShortcut::Replicate)
    }

    #[tokio::test]
    async fn test_default_regions_follow_topology() {
        let peer = SessionRepository::start(peer()).await.unwrap();
        assert!(peer.region().supports_partial_update());
        assert!(peer.expiration_mode().is_native());
        peer.close();

        let client = SessionRepository::start(SessionConfig::default()).await.unwrap();
        assert!(!client.region().supports_partial_update());
        assert!(!client.expiration_mode().is_native());
        client.close();
    }

    #[tokio::test]
    async fn test_nothing_to_save_skips_write() {
        let repo = SessionRepository::start(peer()).await.unwrap();
        let mut record = repo.create_session();
        repo.save(&mut record).await.unwrap();
        let version = record.version();

        repo.save(&mut record).await.unwrap();
        assert_eq!(record.version(), version);
        repo.close();
    }

    #[tokio::test]
    async fn test_principal_cached_on_save() {
        let repo = SessionRepository::start(peer()).await.unwrap();
        let mut record = repo.create_session();
        record.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "alice");
        repo.save(&mut record).await.unwrap();
        assert_eq!(record.principal_name(), Some("alice"));

        let stored = repo.region().peek(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.principal_name.as_deref(), Some("alice"));
        repo.close();
    }

    #[tokio::test]
    async fn test_custom_dirty_predicate_applies_to_loaded_sessions() {
        let repo = SessionRepository::builder(peer())
            .with_dirty_predicate(Arc::new(IdentityDirtyPredicate))
            .start()
            .await
            .unwrap();

        let mut record = repo.create_session();
        record.set_attribute("cart", json!([1]));
        repo.save(&mut record).await.unwrap();

        let mut loaded = repo.get_session(record.id()).await.unwrap().unwrap();
        loaded.set_attribute("cart", json!([1]));
        assert_eq!(loaded.delta().keys(), vec!["cart"]);
        repo.close();
    }

    #[tokio::test]
    async fn test_delta_save_recreates_vanished_entry() {
        let repo = SessionRepository::start(peer()).await.unwrap();
        let mut record = repo.create_session();
        repo.save(&mut record).await.unwrap();

        repo.region().remove(record.id()).await.unwrap();
        record.set_attribute("a", 1);
        repo.save(&mut record).await.unwrap();

        let stored = repo.region().peek(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.attributes.get("a"), Some(&json!(1)));
        repo.close();
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_fails_start() {
        let config = peer().with_max_inactive_interval_secs(i64::MAX);
        let result = SessionRepository::start(config).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let repo = SessionRepository::start(SessionConfig::default()).await.unwrap();
        assert!(!repo.is_closed());
        repo.close();
        repo.close();
        assert!(repo.is_closed());
    }

    #[tokio::test]
    async fn test_get_session_touches() {
        let repo = SessionRepository::start(peer()).await.unwrap();
        let mut record = repo.create_session();
        record.set_last_accessed_time(record.creation_time());
        record.set_max_inactive_interval(TimeDelta::hours(1));
        repo.save(&mut record).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let loaded = repo.get_session(record.id()).await.unwrap().unwrap();
        assert!(loaded.last_accessed_time() > record.last_accessed_time());
        assert!(loaded.has_changes());
        repo.close();
    }

    #[tokio::test]
    async fn test_change_id_retries_old_entry_removal() {
        let region = Arc::new(FailingRemoves {
            inner: LocalRegion::new("sessions"),
            failing: AtomicBool::new(false),
        });
        let repo = SessionRepository::builder(peer())
            .with_region(region.clone())
            .start()
            .await
            .unwrap();
        let (_, mut rx) = repo.events().subscribe_channel();

        let mut record = repo.create_session();
        repo.save(&mut record).await.unwrap();
        let old_id = record.id().clone();
        let new_id = repo.change_session_id(&mut record);

        region.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            repo.save(&mut record).await,
            Err(Error::StoreUnavailable(_))
        ));
        // The new entry was written; only the old one is left over.
        assert!(region.peek(&new_id).await.unwrap().is_some());
        assert!(region.peek(&old_id).await.unwrap().is_some());
        assert!(record.has_changes());

        region.failing.store(false, Ordering::SeqCst);
        record.set_attribute("a", 1);
        repo.save(&mut record).await.unwrap();
        assert!(!record.has_changes());
        assert!(region.peek(&old_id).await.unwrap().is_none());
        let stored = region.peek(&new_id).await.unwrap().unwrap();
        assert_eq!(stored.attributes.get("a"), Some(&json!(1)));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["created", "created", "changed"]);
        repo.close();
    }
}
