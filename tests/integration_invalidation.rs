//! Integration tests for cache invalidation
//!
//! Tests tag registration, tag-based bulk invalidation and dangling tag references

mod common;

use common::*;
use resilient_cache::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(300);

/// Test tagging keys and invalidating them as a group
#[tokio::test]
async fn test_invalidate_tag_removes_every_key() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();
    let tag = format!("user:{}", rand::random::<u32>());

    let keys: Vec<String> = (0..3).map(|i| test_key("roadmap", &format!("tagged_{i}"))).collect();
    for key in &keys {
        let _ = cache.set(key, &test_data::Roadmap::new(1), TTL).await;
    }
    assert!(tags.tag_many(&tag, &keys).await);
    assert_eq!(tags.get_tag_size(&tag).await, 3);

    assert!(tags.invalidate_tag(&tag).await);

    for key in &keys {
        assert!(cache.get::<test_data::Roadmap>(key).await.is_none());
    }
    assert_eq!(tags.get_tag_size(&tag).await, 0, "tag set is deleted with its keys");
}

/// Test invalidating an empty or unknown tag succeeds
#[tokio::test]
async fn test_invalidate_unknown_tag() {
    let (layer, _store) = setup_layer();
    assert!(layer.tag_manager().invalidate_tag("never-registered").await);
    assert!(layer.tag_manager().get_tagged_keys("never-registered").await.is_empty());
}

/// Test a user's entries across namespaces disappear together
#[tokio::test]
async fn test_user_scoped_invalidation() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();
    let keys = cache.keys();

    let profile = keys.user("42", "profile");
    let roadmap = keys.roadmap("7");
    let unrelated = keys.roadmap("8");

    for key in [&profile, &roadmap] {
        let written = tags
            .set_with_tags(key, &test_data::User::new(42), TTL, &["user:42"])
            .await
            .unwrap_or_else(|e| panic!("set_with_tags failed: {e}"));
        assert!(written);
    }
    let _ = cache.set(&unrelated, &test_data::Roadmap::new(8), TTL).await;

    let mut tagged = tags.get_tagged_keys("user:42").await;
    tagged.sort();
    let mut expected = vec![profile.clone(), roadmap.clone()];
    expected.sort();
    assert_eq!(tagged, expected);

    assert!(tags.invalidate_tag("user:42").await);

    assert!(cache.get::<test_data::User>(&profile).await.is_none());
    assert!(cache.get::<test_data::User>(&roadmap).await.is_none());
    assert!(cache.get::<test_data::Roadmap>(&unrelated).await.is_some());
}

/// Test keys deleted through one tag leave harmless references in other tags
#[tokio::test]
async fn test_dangling_references_are_harmless() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();
    let key = test_key("quiz", "shared");

    let _ = tags
        .set_with_tags(&key, &1_u32, TTL, &["course:1", "author:1"])
        .await;

    assert!(tags.invalidate_tag("course:1").await);
    assert!(cache.get::<u32>(&key).await.is_none());

    // The other tag still lists the deleted key
    assert_eq!(tags.get_tagged_keys("author:1").await, vec![key.clone()]);
    assert!(tags.invalidate_tag("author:1").await);
    assert!(tags.get_tagged_keys("author:1").await.is_empty());
}

/// Test bulk invalidation reports how many tags succeeded
#[tokio::test]
async fn test_invalidate_many_tags() {
    let (layer, store) = setup_layer();
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();

    for i in 0..3 {
        let key = test_key("flashcard", &format!("bulk_{i}"));
        let _ = tags
            .set_with_tags(&key, &i, TTL, &[format!("deck:{i}").as_str()])
            .await;
    }

    assert_eq!(tags.invalidate_tags(&["deck:0", "deck:1", "deck:2"]).await, 3);
    assert_eq!(cache.del_pattern("flashcard:*").await, 0);

    store.set_available(false);
    assert_eq!(tags.invalidate_tags(&["deck:0", "deck:1"]).await, 0);
    assert_eq!(tags.invalidate_tags::<&str>(&[]).await, 0);
}

/// Test tag sets carry the tag TTL
#[tokio::test]
async fn test_tag_sets_expire() {
    let (layer, store) = setup_layer();
    let tags = layer.tag_manager();
    let key = test_key("conv", "ttl");

    assert!(tags.tag("conversation:9", &key).await);
    let tag_key = layer.cache_manager().keys().tag("conversation:9");
    match store.ttl(&tag_key).await {
        Ok(resilient_cache::KeyTtl::Expires(left)) => {
            assert!(left <= layer.config().ttl.tag);
        }
        other => panic!("tag set must expire, got {other:?}"),
    }
}

/// Test untagging a key leaves the entry in place
#[tokio::test]
async fn test_untag_key() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();
    let key = test_key("user", "untag");

    let _ = tags.set_with_tags(&key, &5_u32, TTL, &["team:3"]).await;
    assert!(tags.untag_key("team:3", &key).await);
    assert!(!tags.untag_key("team:3", &key).await);

    assert!(tags.invalidate_tag("team:3").await);
    assert_eq!(cache.get::<u32>(&key).await, Some(5));
}

/// Test listing tags returns sorted tag names
#[tokio::test]
async fn test_list_tags() {
    let (layer, _store) = setup_layer();
    let tags = layer.tag_manager();

    for tag in ["zeta", "alpha", "user:1"] {
        assert!(tags.tag(tag, &test_key("user", "listed")).await);
    }

    assert_eq!(tags.list_tags().await, vec!["alpha", "user:1", "zeta"]);
}

/// Test set_with_tags writes nothing when the TTL is invalid
#[tokio::test]
async fn test_set_with_tags_rejects_zero_ttl() {
    let (layer, store) = setup_layer();
    let key = test_key("roadmap", "zero");

    let result = layer
        .tag_manager()
        .set_with_tags(&key, &1_u32, Duration::ZERO, &["roadmap:1"])
        .await;

    assert!(result.is_err());
    assert!(store.is_empty());
}

/// Test one failing tag does not stop the others from being invalidated
#[tokio::test]
async fn test_partial_bulk_invalidation() {
    let layer = setup_layer_over(Arc::new(
        FaultyStore::new().with_broken_set("tag:deck:broken:v1"),
    ));
    let cache = layer.cache_manager();
    let tags = layer.tag_manager();

    let _ = tags.set_with_tags("flashcard:a:v1", &1_u32, TTL, &["deck:ok"]).await;
    let _ = tags.set_with_tags("flashcard:b:v1", &2_u32, TTL, &["deck:broken"]).await;

    assert_eq!(tags.invalidate_tags(&["deck:ok", "deck:broken"]).await, 1);
    assert!(cache.get::<u32>("flashcard:a:v1").await.is_none());
    assert_eq!(cache.get::<u32>("flashcard:b:v1").await, Some(2));
}
