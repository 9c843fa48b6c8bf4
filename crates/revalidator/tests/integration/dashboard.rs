use std::time::Duration;

use revalidator::{ResolveError, Status};

use crate::{Backend, Gate, Resource, Stats, setup_cache, until};

#[tokio::test(start_paused = true)]
async fn test_mutations_invalidate_their_keys() {
    let backend = Backend::new(Duration::from_millis(200));
    backend.create_organization("Acme");
    backend.create_organization("Bluth");
    let cache = setup_cache(backend.resolvers(), |_| {});

    let mut orgs = cache.subscribe("/organizations").unwrap();
    let mut stats = cache.subscribe("/stats").unwrap();
    let snapshot = orgs.settled().await;
    assert_eq!(snapshot.value.unwrap().names(), ["Acme", "Bluth"]);

    // create, then invalidate everything the write touched
    let id = backend.create_organization("Cyberdyne");
    cache.invalidate("/organizations");
    cache.invalidate("/stats");

    let snapshot = orgs.snapshot();
    assert_eq!(snapshot.status, Status::Validating);
    assert_eq!(snapshot.value.unwrap().names(), ["Acme", "Bluth"]);

    let snapshot = orgs.settled().await;
    assert_eq!(snapshot.value.unwrap().names(), ["Acme", "Bluth", "Cyberdyne"]);
    let snapshot = stats.settled().await;
    assert_eq!(
        snapshot.value.as_deref(),
        Some(&Resource::Stats(Stats {
            organizations: 3,
            visible: 3,
        }))
    );

    backend.toggle_visibility(id);
    cache.invalidate("/stats");
    insta::assert_debug_snapshot!(stats.settled().await, @r###"
    Snapshot {
        value: Some(
            Stats(
                Stats {
                    organizations: 3,
                    visible: 2,
                },
            ),
        ),
        error: None,
        status: Settled,
    }
    "###);

    backend.delete_organization(id);
    cache.invalidate_matching(|key| key.starts_with("/organizations") || key == "/stats");
    let snapshot = orgs.settled().await;
    assert_eq!(snapshot.value.unwrap().names(), ["Acme", "Bluth"]);
    stats.settled().await;
    assert_eq!(backend.calls.get(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_paginated_keys_share_a_resolver() {
    let backend = Backend::new(Duration::from_millis(10));
    backend.create_organization("Acme");
    let cache = setup_cache(backend.resolvers(), |_| {});

    let first = cache.fetch("/organizations?page=1").await.unwrap();
    let second = cache.fetch("/organizations?page=2").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.len(), 2);
    assert_eq!(backend.calls.get(), 2);

    // fetching again is served from the cache
    cache.fetch("/organizations?page=1").await.unwrap();
    assert_eq!(backend.calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_keeps_stale_value() {
    let backend = Backend::new(Duration::from_millis(50));
    backend.create_organization("Acme");
    let cache = setup_cache(backend.resolvers(), |config| {
        config.resolve_timeout = Some(Duration::from_secs(15));
    });

    let mut orgs = cache.subscribe("/organizations").unwrap();
    orgs.settled().await;

    backend.expire_session();
    cache.invalidate("/organizations");
    let snapshot = orgs.settled().await;
    assert_eq!(
        snapshot.error,
        Some(ResolveError::Unauthorized("token expired".into()))
    );
    assert_eq!(snapshot.value.unwrap().names(), ["Acme"]);

    // the application reacts to the error by logging in again
    backend.login();
    cache.invalidate("/organizations");
    let snapshot = orgs.settled().await;
    assert_eq!(snapshot.error, None);
    assert_eq!(snapshot.value.unwrap().names(), ["Acme"]);
}

#[tokio::test(start_paused = true)]
async fn test_write_during_fetch_is_observed() {
    let backend = Backend::new(Duration::ZERO);
    backend.create_organization("Acme");
    let gate = Gate::new();
    let cache = setup_cache(backend.gated_resolvers(&gate), |_| {});

    // the first request reads the listing before the write lands
    let mut orgs = cache.subscribe("/organizations").unwrap();
    until(|| gate.waiting() == 1).await;

    backend.create_organization("Bluth");
    cache.invalidate("/organizations");

    gate.release(1);
    until(|| backend.calls.get() == 2).await;
    let snapshot = orgs.snapshot();
    assert_eq!(snapshot.status, Status::Validating);
    assert_eq!(snapshot.value.unwrap().names(), ["Acme"]);

    gate.release(1);
    let snapshot = orgs.settled().await;
    assert_eq!(snapshot.value.unwrap().names(), ["Acme", "Bluth"]);
}

#[tokio::test(start_paused = true)]
async fn test_unused_pages_are_evicted() {
    let backend = Backend::new(Duration::from_millis(10));
    let cache = setup_cache(backend.resolvers(), |config| {
        config.eviction_grace = Some(Duration::from_secs(60));
    });

    let _listing = cache.subscribe("/organizations").unwrap();
    for page in 1..=3 {
        cache
            .fetch(&format!("/organizations?page={page}"))
            .await
            .unwrap();
    }
    assert_eq!(cache.len(), 4);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(cache.len(), 1);
    assert!(cache.peek("/organizations").is_some());
}
