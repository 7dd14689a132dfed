//! HTTP session repository over a data-grid region.
//!
//! This crate stores web sessions in a distributed key-value region with:
//! - Delta tracking, so saves write only the attributes that changed
//! - Pluggable dirty predicates and serializers
//! - Native or proactive idle expiration, with a lazy check on every read
//! - Lookup by principal name and by indexed attribute values
//! - Lifecycle events (created, changed, deleted, expired)
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_session::{SessionConfig, SessionRepository};
//!
//! let config = SessionConfig::default()
//!     .with_max_inactive_interval_secs(900)
//!     .with_indexable_attributes(["tenant"]);
//!
//! let repo = SessionRepository::start(config).await?;
//! let mut session = repo.create_session();
//! session.set_attribute("tenant", "acme");
//! repo.save(&mut session).await?;
//!
//! let found = repo.find_by_index_name_and_index_value("tenant", "acme").await?;
//! ```

mod config;
mod delta;
mod dirty;
mod error;
mod events;
mod expiration;
mod index;
mod record;
pub mod region;
mod repository;
mod serializer;
mod topology;

pub use config::{
    DEFAULT_MAX_INACTIVE_INTERVAL_SECS, DEFAULT_POOL_NAME, DEFAULT_REGION_NAME,
    DEFAULT_SECURITY_CONTEXT_ATTRIBUTE, DEFAULT_SWEEP_INTERVAL_MS, ExpirationConfig,
    SessionConfig,
};
pub use delta::{AttributeDelta, DeltaEntry};
pub use dirty::{
    DirtyPredicate, DirtyPredicateKind, EqualsDirtyPredicate, IdentityDirtyPredicate,
    NeverDirtyPredicate,
};
pub use error::{Error, Result};
pub use events::{SessionEvent, SessionEventBus, SessionEventListener, SubscriptionId};
pub use expiration::{
    ExpirationEngine, ExpirationMode, ExpirationPolicy, FixedDurationExpirationPolicy,
    IdleTimeoutExpirationPolicy, Reaper, policy_from_config,
};
pub use index::{
    IndexDefinition, IndexExpression, IndexManager, PRINCIPAL_NAME_INDEX, PRINCIPAL_NAME_INDEX_NAME,
    PrincipalNameResolver, QueryField, SESSION_ATTRIBUTES_INDEX, index_value,
};
pub use record::{AttributeValue, SessionId, SessionRecord, SessionState};
pub use region::local::LocalRegion;
pub use region::proxy::ProxyRegion;
pub use region::{ExpirationAction, ExpirationAttributes, Region};
pub use repository::{SessionRepository, SessionRepositoryBuilder};
pub use serializer::{
    BinarySessionSerializer, JsonSessionSerializer, SerializerKind, SessionSerializer,
};
pub use topology::{ClientRegionShortcut, RegionShortcut, Topology, is_expiration_allowed};
