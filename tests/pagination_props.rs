//! Property: concatenating `get_feeds` pages yields the same total order,
//! with no duplicates and no gaps, as a single unpaginated listing.

use feedcore::db::EngineConfig;
use feedcore::storage::Storage;
use feedcore::types::{FeedFilter, FeedSort};
use proptest::prelude::*;

async fn populate(storage: &Storage, count: usize) {
    for i in 0..count {
        storage.add_feed(&format!("http://feed-{i:03}"), chrono::Utc::now()).await.unwrap();
    }
}

async fn run_pagination_property(count: usize, page_size: i64) {
    let storage = Storage::open(":memory:", EngineConfig::default()).await.unwrap();
    populate(&storage, count).await;

    let full = storage
        .get_feeds(&FeedFilter::default(), FeedSort::Added, None, None)
        .await
        .unwrap();

    let mut paged = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = storage
            .get_feeds(&FeedFilter::default(), FeedSort::Added, Some(page_size), cursor.as_deref())
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        cursor = Some(page.last().unwrap().url.to_string());
        paged.extend(page);
    }

    let full_urls: Vec<&str> = full.iter().map(|f| f.url.as_ref()).collect();
    let paged_urls: Vec<&str> = paged.iter().map(|f| f.url.as_ref()).collect();
    assert_eq!(full_urls, paged_urls, "paged concatenation must match the unpaginated order exactly");

    let mut seen = std::collections::HashSet::new();
    for url in &paged_urls {
        assert!(seen.insert(*url), "duplicate row {url} across page boundary");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn feed_pagination_has_no_gaps_or_duplicates(count in 0usize..40, page_size in 1i64..15) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(run_pagination_property(count, page_size));
    }
}
