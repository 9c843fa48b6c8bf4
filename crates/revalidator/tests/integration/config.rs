use std::fs;
use std::time::Duration;

use revalidator::config::Config;

use crate::{Backend, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_cache_from_config_file() {
    let tempdir = revalidator_test::tempdir();
    let path = tempdir.path().join("config.yml");
    fs::write(
        &path,
        "cache:\n  eviction_grace: 5m\n  resolve_timeout: 15s\n  revalidate_on_subscribe: true\n",
    )
    .unwrap();

    let config = Config::get(Some(&path)).unwrap();
    assert_eq!(config.cache.eviction_grace, Some(Duration::from_secs(300)));
    assert_eq!(config.cache.dedupe_interval, Duration::from_secs(2));

    let backend = Backend::new(Duration::from_secs(60));
    let cache = setup_cache(backend.resolvers(), |cache_config| *cache_config = config.cache);

    let mut stats = cache.subscribe("/stats").unwrap();
    let snapshot = stats.settled().await;
    assert!(snapshot.value.is_none());
    assert!(matches!(
        snapshot.error,
        Some(revalidator::ResolveError::Timeout(_))
    ));
    drop(stats);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(cache.len(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.is_empty());
}
