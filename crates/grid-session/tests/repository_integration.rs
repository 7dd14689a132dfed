//! Integration tests for saving, loading, deleting and finding sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use grid_session::{
    DirtyPredicateKind, Error, LocalRegion, PRINCIPAL_NAME_INDEX_NAME, ProxyRegion, Region,
    SerializerKind, SessionConfig, SessionEvent, SessionId, SessionRepository,
};
use serde_json::json;

use common::{client_config, drain, init_tracing, kinds, peer_config};

const SLOW_SWEEP: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_save_then_get_round_trip() {
    init_tracing();
    for config in [client_config(SLOW_SWEEP), peer_config()] {
        let repo = SessionRepository::start(config).await.unwrap();
        let mut session = repo.create_session();
        repo.save(&mut session).await.unwrap();

        let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.creation_time(), session.creation_time());
        assert!(loaded.delta().is_empty());
        assert!(loaded.attributes().is_empty());
        repo.close();
    }
}

#[tokio::test]
async fn test_round_trip_through_json_codec() {
    let repo = SessionRepository::start(
        client_config(SLOW_SWEEP).with_serializer(SerializerKind::Json),
    )
    .await
    .unwrap();

    let mut session = repo.create_session();
    session.set_attribute("cart", json!({"items": [1, 2], "coupon": null}));
    repo.save(&mut session).await.unwrap();

    let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(
        loaded.get_attribute("cart"),
        Some(&json!({"items": [1, 2], "coupon": null}))
    );
    repo.close();
}

#[tokio::test]
async fn test_get_missing_session_is_none() {
    let repo = SessionRepository::start(peer_config()).await.unwrap();
    let missing = SessionId::from("does-not-exist");
    assert!(repo.get_session(&missing).await.unwrap().is_none());
    repo.close();
}

#[tokio::test]
async fn test_double_delete_emits_one_event() {
    let repo = SessionRepository::start(client_config(SLOW_SWEEP)).await.unwrap();
    let (_, mut rx) = repo.events().subscribe_channel();

    let mut session = repo.create_session();
    repo.save(&mut session).await.unwrap();

    assert!(repo.delete_by_id(session.id()).await.unwrap());
    assert!(!repo.delete_by_id(session.id()).await.unwrap());
    assert!(repo.get_session(session.id()).await.unwrap().is_none());

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["created", "deleted"]);
    repo.close();
}

#[tokio::test]
async fn test_changed_event_lists_dirty_keys() {
    for config in [client_config(SLOW_SWEEP), peer_config()] {
        let repo = SessionRepository::start(config).await.unwrap();
        let (_, mut rx) = repo.events().subscribe_channel();

        let mut session = repo.create_session();
        session.set_attribute("a", 1);
        repo.save(&mut session).await.unwrap();

        let mut loaded = repo.get_session(session.id()).await.unwrap().unwrap();
        loaded.set_attribute("a", 1); // equal, not dirty
        loaded.set_attribute("b", "x");
        loaded.remove_attribute("a");
        repo.save(&mut loaded).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                SessionEvent::Created {
                    id: session.id().clone()
                },
                SessionEvent::Changed {
                    id: session.id().clone(),
                    keys: vec!["a".to_string(), "b".to_string()],
                },
            ]
        );

        let stored = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.attribute_names(), vec!["b"]);
        repo.close();
    }
}

#[tokio::test]
async fn test_never_dirty_predicate_persists_nothing_new() {
    let repo = SessionRepository::start(peer_config().with_dirty_predicate(DirtyPredicateKind::Never))
        .await
        .unwrap();

    let mut session = repo.create_session();
    session.set_attribute("a", 1);
    // New sessions are written in full regardless.
    repo.save(&mut session).await.unwrap();

    session.set_attribute("a", 2);
    assert!(session.delta().is_empty());
    repo.save(&mut session).await.unwrap();

    let stored = repo.region().peek(session.id()).await.unwrap().unwrap();
    assert_eq!(stored.attributes.get("a"), Some(&json!(1)));
    repo.close();
}

#[tokio::test]
async fn test_find_by_principal_name() {
    for config in [client_config(SLOW_SWEEP), peer_config()] {
        let repo = SessionRepository::start(config).await.unwrap();

        let mut alice = repo.create_session();
        alice.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "alice");
        repo.save(&mut alice).await.unwrap();

        let mut bob = repo.create_session();
        bob.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "bob");
        repo.save(&mut bob).await.unwrap();

        let found = repo
            .find_by_index_name_and_index_value(PRINCIPAL_NAME_INDEX_NAME, "alice")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(alice.id()));

        let nobody = repo.find_by_principal_name("carol").await.unwrap();
        assert!(nobody.is_empty());
        repo.close();
    }
}

#[tokio::test]
async fn test_principal_from_security_context() {
    let repo = SessionRepository::start(peer_config()).await.unwrap();
    let mut session = repo.create_session();
    session.set_attribute(
        "SECURITY_CONTEXT",
        json!({"authentication": {"name": "dave", "authorities": ["USER"]}}),
    );
    repo.save(&mut session).await.unwrap();

    let found = repo.find_by_principal_name("dave").await.unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), vec![session.id()]);
    repo.close();
}

#[tokio::test]
async fn test_principal_index_follows_changes() {
    let repo = SessionRepository::start(peer_config()).await.unwrap();
    let mut session = repo.create_session();
    session.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "alice");
    repo.save(&mut session).await.unwrap();

    session.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "alicia");
    repo.save(&mut session).await.unwrap();
    assert!(repo.find_by_principal_name("alice").await.unwrap().is_empty());
    assert_eq!(repo.find_by_principal_name("alicia").await.unwrap().len(), 1);

    repo.delete_by_id(session.id()).await.unwrap();
    assert!(repo.find_by_principal_name("alicia").await.unwrap().is_empty());
    repo.close();
}

#[tokio::test]
async fn test_find_by_indexed_attribute() {
    let repo = SessionRepository::start(
        client_config(SLOW_SWEEP).with_indexable_attributes(["tenant", "tier"]),
    )
    .await
    .unwrap();

    let mut ids = Vec::new();
    for (tenant, tier) in [("acme", 1), ("acme", 2), ("globex", 1)] {
        let mut session = repo.create_session();
        session.set_attribute("tenant", tenant);
        session.set_attribute("tier", tier);
        repo.save(&mut session).await.unwrap();
        ids.push(session.id().clone());
    }

    let acme = repo
        .find_by_index_name_and_index_value("tenant", "acme")
        .await
        .unwrap();
    assert_eq!(acme.len(), 2);
    assert!(acme.contains_key(&ids[0]) && acme.contains_key(&ids[1]));

    let tier_one = repo.find_by_index_name_and_index_value("tier", "1").await.unwrap();
    assert_eq!(tier_one.len(), 2);
    assert!(tier_one.contains_key(&ids[2]));

    assert!(
        repo.find_by_index_name_and_index_value("tenant", "initech")
            .await
            .unwrap()
            .is_empty()
    );
    repo.close();
}

#[tokio::test]
async fn test_malformed_index_is_fatal_at_start() {
    let result =
        SessionRepository::start(peer_config().with_indexable_attributes(["ok", "bad]key"])).await;
    assert!(matches!(result, Err(Error::IndexCreation { .. })));
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_start() {
    let result = SessionRepository::start(SessionConfig::default().with_region_name("")).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_indexes_created_once_across_restarts() {
    let region = Arc::new(LocalRegion::new("ClusteredSessions"));
    let config = peer_config().with_indexable_attributes(["tenant"]);

    let first = SessionRepository::builder(config.clone())
        .with_region(region.clone())
        .start()
        .await
        .unwrap();
    first.close();

    let second = SessionRepository::builder(config)
        .with_region(region.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(
        region.index_names(),
        vec!["principalNameIndex", "sessionAttributesIndex"]
    );
    assert!(second.indexes().is_ready());
    second.close();
}

#[tokio::test]
async fn test_concurrent_saves_conflict() {
    for config in [client_config(SLOW_SWEEP), peer_config()] {
        let repo = SessionRepository::start(config).await.unwrap();
        let mut session = repo.create_session();
        repo.save(&mut session).await.unwrap();

        let mut first = repo.get_session(session.id()).await.unwrap().unwrap();
        let mut second = repo.get_session(session.id()).await.unwrap().unwrap();

        first.set_attribute("x", 1);
        repo.save(&mut first).await.unwrap();

        second.set_attribute("y", 2);
        let err = repo.save(&mut second).await.unwrap_err();
        assert!(matches!(err, Error::Concurrency { ref id, .. } if id == session.id()));

        // Caller retries with fresh state.
        let mut fresh = repo.get_session(session.id()).await.unwrap().unwrap();
        fresh.set_attribute("y", 2);
        repo.save(&mut fresh).await.unwrap();
        repo.close();
    }
}

#[tokio::test]
async fn test_unavailable_store() {
    let server = Arc::new(LocalRegion::new("ClusteredSessions"));
    let proxy = Arc::new(ProxyRegion::new(server, SerializerKind::Binary.build(), "DEFAULT"));
    let repo = SessionRepository::builder(client_config(SLOW_SWEEP))
        .with_region(proxy.clone())
        .start()
        .await
        .unwrap();

    let mut session = repo.create_session();
    repo.save(&mut session).await.unwrap();

    proxy.disconnect();
    assert!(matches!(
        repo.get_session(session.id()).await,
        Err(Error::StoreUnavailable(_))
    ));
    session.set_attribute("a", 1);
    assert!(matches!(
        repo.save(&mut session).await,
        Err(Error::StoreUnavailable(_))
    ));
    assert!(matches!(
        repo.delete_by_id(session.id()).await,
        Err(Error::StoreUnavailable(_))
    ));

    // Failed save kept the pending change.
    proxy.reconnect();
    repo.save(&mut session).await.unwrap();
    let loaded = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(loaded.get_attribute("a"), Some(&json!(1)));
    repo.close();
}

#[tokio::test]
async fn test_change_session_id() {
    for config in [client_config(SLOW_SWEEP), peer_config()] {
        let repo = SessionRepository::start(config).await.unwrap();
        let (_, mut rx) = repo.events().subscribe_channel();

        let mut session = repo.create_session();
        session.set_attribute(PRINCIPAL_NAME_INDEX_NAME, "alice");
        repo.save(&mut session).await.unwrap();
        let old_id = session.id().clone();

        let new_id = repo.change_session_id(&mut session);
        assert_ne!(new_id, old_id);
        repo.save(&mut session).await.unwrap();

        assert!(repo.get_session(&old_id).await.unwrap().is_none());
        let moved = repo.get_session(&new_id).await.unwrap().unwrap();
        assert_eq!(moved.get_attribute(PRINCIPAL_NAME_INDEX_NAME), Some(&json!("alice")));

        let found = repo.find_by_principal_name("alice").await.unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec![&new_id]);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                SessionEvent::Created { id: old_id },
                SessionEvent::Created { id: new_id },
            ]
        );
        repo.close();
    }
}

#[tokio::test]
async fn test_clones_share_state() {
    let repo = SessionRepository::start(peer_config()).await.unwrap();
    let other = repo.clone();

    let mut session = repo.create_session();
    repo.save(&mut session).await.unwrap();
    assert!(other.get_session(session.id()).await.unwrap().is_some());

    other.close();
    assert!(repo.is_closed());
}

#[tokio::test]
async fn test_start_from_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sessions.toml");
    std::fs::write(
        &path,
        r#"
region_name = "Sessions"
topology = "peer"
indexable_attributes = ["tenant"]
"#,
    )
    .unwrap();

    let config = SessionConfig::load(&path).unwrap();
    let repo = SessionRepository::start(config).await.unwrap();
    assert_eq!(repo.region().name(), "Sessions");
    assert_eq!(repo.indexes().definitions().len(), 2);
    repo.close();
}
