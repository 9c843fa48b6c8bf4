use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use revalidator::{CacheConfig, ResolveError, ResolverRegistry, ResourceCache, resolver_fn};

use crate::CallCounter;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_across_threads() {
    revalidator_test::setup();

    let calls = CallCounter::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let resolver = {
        let calls = calls.clone();
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        resolver_fn(move |_key: String| {
            let version = calls.hit();
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ResolveError>(version)
            }
        })
    };
    let cache = ResourceCache::new(
        CacheConfig::default(),
        ResolverRegistry::new().with("/events", resolver),
        tokio::runtime::Handle::current(),
    );

    let tasks = (0..8).map(|worker| {
        let cache = cache.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                let mut events = cache.subscribe("/events").unwrap();
                if (worker + round) % 3 == 0 {
                    cache.invalidate("/events");
                }
                let snapshot = events.settled().await;
                assert!(snapshot.value.is_some());
            }
        })
    });
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(calls.get() >= 1);
    assert!(calls.get() <= 8 * 50);
    assert_eq!(cache.subscriber_count("/events"), 0);
}
