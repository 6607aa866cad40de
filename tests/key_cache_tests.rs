//! Public key cache behavior against a recording origin
//!
//! - cache hits never reach the origin
//! - a miss fetches the full active set once and caches every key
//! - unknown key ids fail without a cache write

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FakeOrigin;
use gateway_auth::Error;
use gateway_auth::keys::{PublicKeyCache, cache_key};
use gateway_auth::origin::OriginClient;
use gateway_auth::store::{CacheStore, InMemoryCacheStore, set_json};

fn build(origin: &Arc<FakeOrigin>, coalesce: bool) -> (PublicKeyCache, Arc<InMemoryCacheStore>) {
    let store = Arc::new(InMemoryCacheStore::new());
    let cache = PublicKeyCache::new(
        Arc::clone(&store) as Arc<dyn CacheStore>,
        Arc::clone(origin) as Arc<dyn OriginClient>,
        Duration::from_secs(300),
        coalesce,
    );
    (cache, store)
}

#[tokio::test]
async fn cached_key_never_calls_origin() {
    // GIVEN: k1 already cached
    let origin = Arc::new(FakeOrigin::new());
    let (cache, store) = build(&origin, true);
    set_json(
        store.as_ref(),
        &cache_key("k1"),
        &common::fixture_key("k1"),
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    // WHEN: resolved repeatedly
    for _ in 0..5 {
        cache.get_public_key("k1").await.unwrap();
    }

    // THEN: the origin was never asked
    assert_eq!(FakeOrigin::calls(&origin.key_calls), 0);
}

#[tokio::test]
async fn miss_fetches_full_set_caches_all_and_returns_requested() {
    // GIVEN: origin active set [k1, k2], empty cache
    let origin = Arc::new(FakeOrigin::new().with_keys(&["k1", "k2"]));
    let (cache, store) = build(&origin, true);

    // WHEN: k2 is requested
    let key = cache.get_public_key("k2").await.unwrap();

    // THEN: one fetch, both cached, k2 returned
    assert_eq!(key.kid, "k2");
    assert_eq!(FakeOrigin::calls(&origin.key_calls), 1);
    assert!(store.exists("jwks:key:k1").await.unwrap());
    assert!(store.exists("jwks:key:k2").await.unwrap());

    // AND: the next lookup for k2 is a pure cache hit
    cache.get_public_key("k2").await.unwrap();
    assert_eq!(FakeOrigin::calls(&origin.key_calls), 1);
}

#[tokio::test]
async fn key_absent_everywhere_is_not_found_without_write() {
    let origin = Arc::new(FakeOrigin::new().with_keys(&["k1"]));
    let (cache, store) = build(&origin, true);

    let err = cache.get_public_key("k9").await.unwrap_err();

    assert!(matches!(err, Error::PublicKeyNotFound(ref kid) if kid == "k9"));
    assert!(!store.exists("jwks:key:k9").await.unwrap());
    assert_eq!(store.stats().size, 1);
}

#[tokio::test]
async fn each_miss_fetches_when_coalescing_is_off() {
    let origin = Arc::new(FakeOrigin::new().with_keys(&["k1"]));
    let (cache, _) = build(&origin, false);

    assert!(cache.get_public_key("k7").await.is_err());
    assert!(cache.get_public_key("k8").await.is_err());

    assert_eq!(FakeOrigin::calls(&origin.key_calls), 2);
}

#[tokio::test]
async fn refresh_all_keys_picks_up_rotated_keys() {
    // GIVEN: k1 cached, then the origin rotates to k2
    let origin = Arc::new(FakeOrigin::new().with_keys(&["k1"]));
    let (cache, _) = build(&origin, true);
    cache.get_public_key("k1").await.unwrap();
    *origin.keys.lock() = vec![common::fixture_key("k1"), common::fixture_key("k2")];

    // WHEN: an external refresh signal arrives
    let count = cache.refresh_all_keys().await.unwrap();

    // THEN: k2 resolves from cache with no further fetch
    assert_eq!(count, 2);
    cache.get_public_key("k2").await.unwrap();
    assert_eq!(FakeOrigin::calls(&origin.key_calls), 2);
}

#[tokio::test]
async fn origin_outage_surfaces_as_refresh_failure() {
    let origin = Arc::new(FakeOrigin::new());
    *origin.keys_fail.lock() = true;
    let (cache, _) = build(&origin, true);

    assert!(matches!(
        cache.refresh_all_keys().await,
        Err(Error::KeyRefreshFailed(_))
    ));
    assert!(matches!(
        cache.get_public_key("k1").await,
        Err(Error::KeyRefreshFailed(_))
    ));

    // A later attempt is not stuck on the failed fetch
    *origin.keys_fail.lock() = false;
    assert_eq!(cache.get_public_key("k1").await.unwrap().kid, "k1");
}

#[tokio::test]
async fn refresh_during_a_slow_miss_sees_the_rotated_set() {
    // GIVEN: a slow origin whose set is [k1] when the miss starts
    let origin = Arc::new(
        FakeOrigin::new()
            .with_keys(&["k1"])
            .with_key_delay(Duration::from_millis(100)),
    );
    let (cache, store) = build(&origin, true);
    let miss = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_public_key("k1").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // WHEN: k2 is published and a key refresh is signalled mid-fetch
    *origin.keys.lock() = vec![common::fixture_key("k1"), common::fixture_key("k2")];
    let count = cache.refresh_all_keys().await.unwrap();

    // THEN: the refresh made its own fetch and cached the new key
    assert_eq!(count, 2);
    assert_eq!(FakeOrigin::calls(&origin.key_calls), 2);
    assert!(store.exists(&cache_key("k2")).await.unwrap());

    // AND: the earlier miss still resolves
    assert_eq!(miss.await.unwrap().unwrap().kid, "k1");
}
