//! Cache persistence across manager instances sharing one directory.

use std::time::Duration;

use harvester_core::{BookDetail, CacheCategory, CacheConfig, CacheKey, CacheManager, ChapterInfo};
use tempfile::TempDir;
use tokio_test::assert_ok;

fn manager(dir: &TempDir) -> CacheManager {
    CacheManager::new(CacheConfig {
        dir: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    })
}

fn detail() -> BookDetail {
    BookDetail {
        title: "斗破苍穹".into(),
        url: "https://demo.example/book/1/".into(),
        author: Some("天蚕土豆".into()),
        intro: None,
        category: None,
        cover_url: None,
        status: None,
        word_count: None,
        update_time: None,
        latest_chapter: None,
        toc_url: "https://demo.example/book/1/".into(),
        source_id: "demo".into(),
    }
}

#[tokio::test]
async fn test_disk_tier_survives_restart() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let key = CacheKey::book("demo", "https://demo.example/book/1/");

    let first = manager(&dir);
    assert_ok!(first.set(&key, &detail(), None).await);
    drop(first);

    let second = manager(&dir);
    let cached: Option<BookDetail> = second.get(&key).await;
    assert_eq!(cached, Some(detail()));

    let stats = second.stats();
    assert_eq!(stats.disk_hits, 1);
    assert_eq!(stats.memory_hits, 0);
    // The disk hit was promoted into memory.
    assert_eq!(second.memory_entries(CacheCategory::Books), 1);
    let again: Option<BookDetail> = second.get(&key).await;
    assert!(again.is_some());
    assert_eq!(second.stats().memory_hits, 1);
}

#[tokio::test]
async fn test_expired_entries_are_misses_and_swept() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let key = CacheKey::toc("demo", "https://demo.example/book/1/");
    let toc = vec![ChapterInfo::new("第1章", "https://demo.example/book/1/1.html", 1)];

    let cache = manager(&dir);
    assert_ok!(cache.set(&key, &toc, Some(Duration::from_millis(1))).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reopened = manager(&dir);
    let cached: Option<Vec<ChapterInfo>> = reopened.get(&key).await;
    assert!(cached.is_none());
    assert_eq!(reopened.stats().misses, 1);

    assert_eq!(cache.sweep_expired().await, 1);
    assert_eq!(cache.sweep_expired().await, 0);
}

#[tokio::test]
async fn test_invalidate_by_glob_reaches_disk() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let cache = manager(&dir);
    for book in 1..=3 {
        let url = format!("https://demo.example/book/{book}/");
        assert_ok!(cache.set(&CacheKey::toc("demo", &url), &Vec::<ChapterInfo>::new(), None).await);
        assert_ok!(cache.set(&CacheKey::toc("other", &url), &Vec::<ChapterInfo>::new(), None).await);
    }
    assert_ok!(cache.set(&CacheKey::book("demo", "https://demo.example/book/1/"), &detail(), None).await);

    assert_eq!(cache.invalidate("toc:demo:*").await, 3);

    let reopened = manager(&dir);
    let gone: Option<Vec<ChapterInfo>> = reopened.get(&CacheKey::toc("demo", "https://demo.example/book/2/")).await;
    assert!(gone.is_none());
    let kept: Option<Vec<ChapterInfo>> = reopened.get(&CacheKey::toc("other", "https://demo.example/book/2/")).await;
    assert!(kept.is_some());
    let book: Option<BookDetail> = reopened.get(&CacheKey::book("demo", "https://demo.example/book/1/")).await;
    assert!(book.is_some());
}

#[tokio::test]
async fn test_disabled_cache_never_stores() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let cache = CacheManager::new(CacheConfig {
        enabled: false,
        dir: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    });
    let key = CacheKey::search("demo", "斗破");
    assert_ok!(cache.set(&key, &vec!["x".to_string()], None).await);
    let cached: Option<Vec<String>> = cache.get(&key).await;
    assert!(cached.is_none());
    assert!(!cache.stats().enabled);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
