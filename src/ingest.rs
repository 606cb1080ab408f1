//! Video ingestion: turning a batch of external ids into catalogue rows.
//!
//! A batch runs in three steps:
//!
//! 1. plan: drop ids that repeat or are already stored,
//! 2. fetch: one snippet request and one statistics request for the rest,
//!    with no database lock held,
//! 3. persist: a single write transaction that creates the videos and, for
//!    each video it actually created, the uploader's self-vote, one view
//!    count snapshot and the tag associations.
//!
//! A failure in step 2 happens before anything is written. A failure in
//! step 3 rolls back the whole batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use crate::catalog::{Catalog, Category, UserId, Video, VideoId, format_timestamp, now};
use crate::dedup::unique_ids;
use crate::error::CatalogResult;
use crate::tags::{attach_in, normalize_titles, resolve_in};
use crate::votes::{SELF_VOTE, insert_video_vote};
use crate::youtube::{VideoApi, VideoSnippet};

/// Everything needed to create one video row and its dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedVideo {
    pub snippet: VideoSnippet,
    pub views: i64,
}

/// Fetches snippets and view counts for `video_ids`.
///
/// Ids the API does not return, or returns without a view count, are left
/// out (and logged) so every video created from the result gets its
/// snapshot.
pub fn fetch_batch(api: &dyn VideoApi, video_ids: &[String]) -> CatalogResult<Vec<FetchedVideo>> {
    if video_ids.is_empty() {
        return Ok(Vec::new());
    }
    let snippets = api.video_snippets(video_ids)?;
    let mut by_id: HashMap<String, VideoSnippet> = snippets
        .into_iter()
        .map(|snippet| (snippet.video_id.clone(), snippet))
        .collect();
    for id in video_ids {
        if !by_id.contains_key(id) {
            log::warn!("video api returned no metadata for {id}, skipping");
        }
    }

    let found: Vec<String> = video_ids
        .iter()
        .filter(|id| by_id.contains_key(*id))
        .cloned()
        .collect();
    if found.is_empty() {
        return Ok(Vec::new());
    }
    let views: HashMap<String, i64> = api
        .view_counts(&found)?
        .into_iter()
        .map(|report| (report.video_id, report.views))
        .collect();

    let mut fetched = Vec::with_capacity(found.len());
    for id in found {
        let Some(snippet) = by_id.remove(&id) else {
            continue;
        };
        match views.get(&id) {
            Some(&views) => fetched.push(FetchedVideo { snippet, views }),
            None => log::warn!("video api returned no view count for {id}, skipping"),
        }
    }
    Ok(fetched)
}

pub(crate) fn insert_view_count(
    conn: &Connection,
    video: VideoId,
    counted_at: DateTime<Utc>,
    views: i64,
) -> CatalogResult<()> {
    conn.prepare_cached(
        "INSERT INTO view_counts (video_id, counted_at, views) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![video, format_timestamp(counted_at), views])?;
    Ok(())
}

impl Catalog {
    /// Persists a fetched batch in one transaction and returns the ids of
    /// the rows it created. Videos stored by a concurrent batch in the
    /// meantime are left untouched and get no second self-vote.
    pub fn persist_batch(
        &mut self,
        uploader: UserId,
        batch: &[FetchedVideo],
    ) -> CatalogResult<Vec<VideoId>> {
        self.ensure_exists("users", "user", uploader)?;
        let stamp = now();
        let stamp_text = format_timestamp(stamp);

        let tx = self.write_tx()?;
        let mut created = Vec::with_capacity(batch.len());
        for item in batch {
            let snippet = &item.snippet;
            let inserted = tx
                .prepare_cached(
                    r#"
                    INSERT INTO videos (video_id, title, description, published,
                                        created, updated, category_id, uploader_id)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
                    ON CONFLICT(video_id) DO NOTHING
                    "#,
                )?
                .execute(params![
                    snippet.video_id,
                    snippet.title,
                    snippet.description,
                    format_timestamp(snippet.published),
                    stamp_text,
                    snippet.category_id,
                    uploader,
                ])?;
            if inserted == 0 {
                log::debug!("{} was stored concurrently, leaving it", snippet.video_id);
                continue;
            }
            let video = tx.last_insert_rowid();

            insert_video_vote(&tx, video, uploader, SELF_VOTE)?;
            insert_view_count(&tx, video, stamp, item.views)?;
            let titles = normalize_titles(&snippet.tags);
            if !titles.is_empty() {
                let tags = resolve_in(&tx, &titles)?;
                attach_in(&tx, video, &tags)?;
            }
            created.push(video);
        }
        tx.commit()?;
        Ok(created)
    }

    /// Stores one snapshot per `(video, views)` pair, all stamped `counted_at`.
    pub fn insert_view_counts(
        &mut self,
        counts: &[(VideoId, i64)],
        counted_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        let tx = self.write_tx()?;
        for (video, views) in counts {
            insert_view_count(&tx, *video, counted_at, *views)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Creates videos for `video_ids` on behalf of `uploader` and returns every
/// stored video matching the request, including ones that already existed.
///
/// The catalogue lock is taken for planning and again for persisting, and is
/// released while the API is queried.
pub fn ingest_videos<S: AsRef<str>>(
    catalog: &Mutex<Catalog>,
    api: &dyn VideoApi,
    uploader: UserId,
    video_ids: &[S],
) -> CatalogResult<Vec<Video>> {
    let requested = unique_ids(video_ids);
    let missing = {
        let catalog = catalog.lock();
        catalog.ensure_exists("users", "user", uploader)?;
        catalog.missing_video_ids(&requested)?
    };

    if !missing.is_empty() {
        let batch = fetch_batch(api, &missing)?;
        let created = catalog.lock().persist_batch(uploader, &batch)?;
        log::info!(
            "ingested {} new video(s) for user {uploader} ({} requested, {} already stored)",
            created.len(),
            requested.len(),
            requested.len() - missing.len()
        );
    }

    catalog.lock().videos_by_external_ids(&requested)
}

/// Takes a fresh view count snapshot for each of `videos`.
pub fn record_view_counts(
    catalog: &mut Catalog,
    api: &dyn VideoApi,
    videos: &[VideoId],
) -> CatalogResult<usize> {
    let mut by_external = HashMap::with_capacity(videos.len());
    for &video in videos {
        let row = catalog.video(video)?;
        by_external.insert(row.video_id, video);
    }
    let external: Vec<String> = by_external.keys().cloned().collect();
    if external.is_empty() {
        return Ok(0);
    }

    let counts: Vec<(VideoId, i64)> = api
        .view_counts(&external)?
        .into_iter()
        .filter_map(|report| by_external.get(&report.video_id).map(|&id| (id, report.views)))
        .collect();
    catalog.insert_view_counts(&counts, now())?;
    Ok(counts.len())
}

/// Replaces the stored category list with the API's list for `region`.
pub fn sync_categories(
    catalog: &mut Catalog,
    api: &dyn VideoApi,
    region: &str,
) -> CatalogResult<Vec<Category>> {
    let categories = api.categories(region)?;
    catalog.upsert_categories(&categories)?;
    log::info!("synced {} categories for region {region}", categories.len());
    catalog.categories()
}

/// Searches a category and ingests what the search returns.
pub fn ingest_category(
    catalog: &Mutex<Catalog>,
    api: &dyn VideoApi,
    uploader: UserId,
    category_id: &str,
    max_results: u32,
) -> CatalogResult<Vec<Video>> {
    let ids = api.search_by_category(category_id, max_results)?;
    ingest_videos(catalog, api, uploader, &ids)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::catalog::testing;
    use crate::error::CatalogError;
    use crate::youtube::ViewCountReport;
    use crate::youtube::fake::FakeApi;

    use super::*;

    fn count(catalog: &Catalog, table: &str) -> i64 {
        catalog
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn setup() -> (Mutex<Catalog>, UserId) {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "10", "Music");
        testing::category(&mut catalog, "23", "Comedy");
        let alice = testing::user(&mut catalog, "alice");
        (Mutex::new(catalog), alice)
    }

    #[test]
    fn ingest_creates_video_vote_snapshot_and_tags() {
        let (catalog, alice) = setup();
        let api = FakeApi::default().with_video("abc123", "10", &["jazz", "live", "jazz"]);

        let videos = ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap();
        assert_eq!(videos.len(), 1);
        let video = &videos[0];
        assert_eq!(video.video_id, "abc123");
        assert_eq!(video.title, "Title of abc123");
        assert_eq!(video.category_id, "10");
        assert_eq!(video.uploader_id, alice);
        assert_eq!(video.tags, ["jazz", "live"]);
        assert_eq!(video.published.to_rfc3339(), "2017-03-01T12:00:00+00:00");

        assert_eq!(catalog.lock().video_score(video.id).unwrap(), 1);
        let snapshots = catalog.lock().view_counts(video.id).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].views, 1_000);
    }

    #[test]
    fn reingesting_is_idempotent() {
        let (catalog, alice) = setup();
        let api = FakeApi::default()
            .with_video("abc123", "10", &[])
            .with_video("xyz789", "23", &["standup"]);

        ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap();
        let videos = ingest_videos(&catalog, &api, alice, &["abc123", "xyz789"]).unwrap();

        let ids: Vec<_> = videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, ["abc123", "xyz789"]);
        assert_eq!(
            api.requested_snippets(),
            vec![vec!["abc123".to_string()], vec!["xyz789".to_string()]]
        );
        assert_eq!(count(&catalog.lock(), "videos"), 2);
        assert_eq!(count(&catalog.lock(), "video_votes"), 2);
        assert_eq!(count(&catalog.lock(), "view_counts"), 2);

        ingest_videos(&catalog, &api, alice, &["abc123", "xyz789"]).unwrap();
        assert_eq!(api.requested_snippets().len(), 2);
        assert_eq!(count(&catalog.lock(), "videos"), 2);
    }

    /// Records whether the catalogue was free while each API call ran.
    struct LockCheckingApi<'a> {
        catalog: &'a Mutex<Catalog>,
        inner: FakeApi,
        held_during_call: AtomicBool,
    }

    impl LockCheckingApi<'_> {
        fn check(&self) {
            if self.catalog.try_lock().is_none() {
                self.held_during_call.store(true, Ordering::SeqCst);
            }
        }
    }

    impl VideoApi for LockCheckingApi<'_> {
        fn categories(&self, region: &str) -> CatalogResult<Vec<Category>> {
            self.check();
            self.inner.categories(region)
        }

        fn search_by_category(
            &self,
            category_id: &str,
            max_results: u32,
        ) -> CatalogResult<Vec<String>> {
            self.check();
            self.inner.search_by_category(category_id, max_results)
        }

        fn video_snippets(&self, video_ids: &[String]) -> CatalogResult<Vec<VideoSnippet>> {
            self.check();
            self.inner.video_snippets(video_ids)
        }

        fn view_counts(&self, video_ids: &[String]) -> CatalogResult<Vec<ViewCountReport>> {
            self.check();
            self.inner.view_counts(video_ids)
        }
    }

    #[test]
    fn api_is_queried_without_the_catalogue_lock() {
        let (catalog, alice) = setup();
        let api = LockCheckingApi {
            catalog: &catalog,
            inner: FakeApi::default().with_video("abc123", "10", &["jazz"]),
            held_during_call: AtomicBool::new(false),
        };
        let videos = ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(api.inner.requested_snippets().len(), 1);
        assert!(!api.held_during_call.load(Ordering::SeqCst));
    }

    #[test]
    fn duplicate_ids_in_one_request_fetch_once() {
        let (catalog, alice) = setup();
        let api = FakeApi::default().with_video("abc123", "10", &[]);
        let videos =
            ingest_videos(&catalog, &api, alice, &["abc123", "abc123", "abc123"]).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(api.requested_snippets(), vec![vec!["abc123".to_string()]]);
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let (catalog, alice) = setup();
        let api = FakeApi::default().with_video("abc123", "10", &[]);
        let videos = ingest_videos(&catalog, &api, alice, &["gone", "abc123"]).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].video_id, "abc123");
    }

    #[test]
    fn metadata_failure_writes_nothing() {
        let (catalog, alice) = setup();
        let mut api = FakeApi::default().with_video("abc123", "10", &["jazz"]);
        api.fail_snippets = Some((403, "quotaExceeded".to_string()));

        let err = ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap_err();
        assert!(
            matches!(&err, CatalogError::Api { status: 403, message } if message == "quotaExceeded")
        );
        assert_eq!(count(&catalog.lock(), "videos"), 0);
        assert_eq!(api.view_requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn view_count_failure_leaves_no_partial_video() {
        let (catalog, alice) = setup();
        let mut api = FakeApi::default().with_video("abc123", "10", &["jazz"]);
        api.fail_views = Some((500, "backend error".to_string()));

        let err = ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap_err();
        assert!(matches!(err, CatalogError::Api { status: 500, .. }));
        assert_eq!(count(&catalog.lock(), "videos"), 0);
        assert_eq!(count(&catalog.lock(), "tags"), 0);
    }

    #[test]
    fn unknown_category_rolls_back_whole_batch() {
        let (catalog, alice) = setup();
        let api = FakeApi::default()
            .with_video("abc123", "10", &["jazz"])
            .with_video("xyz789", "99", &[]);

        let err = ingest_videos(&catalog, &api, alice, &["abc123", "xyz789"]).unwrap_err();
        assert!(matches!(err, CatalogError::MissingReference(_)), "{err:?}");
        assert_eq!(count(&catalog.lock(), "videos"), 0);
        assert_eq!(count(&catalog.lock(), "video_votes"), 0);
        assert_eq!(count(&catalog.lock(), "tags"), 0);
    }

    #[test]
    fn unknown_uploader_fails_before_fetching() {
        let (catalog, _) = setup();
        let api = FakeApi::default().with_video("abc123", "10", &[]);
        let err = ingest_videos(&catalog, &api, 404, &["abc123"]).unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { kind: "user", .. }));
        assert!(api.requested_snippets().is_empty());
    }

    #[test]
    fn persist_skips_rows_created_concurrently() {
        let (catalog, alice) = setup();
        let bob = testing::user(&mut catalog.lock(), "bob");
        let api = FakeApi::default().with_video("abc123", "10", &[]);
        let batch = fetch_batch(&api, &["abc123".to_string()]).unwrap();

        let first = catalog.lock().persist_batch(alice, &batch).unwrap();
        let second = catalog.lock().persist_batch(bob, &batch).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(count(&catalog.lock(), "video_votes"), 1);
        assert_eq!(catalog.lock().video(first[0]).unwrap().uploader_id, alice);
    }

    #[test]
    fn videos_without_statistics_are_skipped() {
        let (catalog, alice) = setup();
        let mut api = FakeApi::default()
            .with_video("abc123", "10", &[])
            .with_video("xyz789", "10", &[]);
        api.views.remove("xyz789");
        let videos = ingest_videos(&catalog, &api, alice, &["abc123", "xyz789"]).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(count(&catalog.lock(), "view_counts"), 1);
    }

    #[test]
    fn fresh_snapshots_are_recorded() {
        let (catalog, alice) = setup();
        let mut api = FakeApi::default().with_video("abc123", "10", &[]);
        let video = ingest_videos(&catalog, &api, alice, &["abc123"]).unwrap()[0].id;

        api.views.insert("abc123".to_string(), 5_000);
        assert_eq!(record_view_counts(&mut catalog.lock(), &api, &[video]).unwrap(), 1);
        let snapshots = catalog.lock().view_counts(video).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].views, 5_000);
    }

    #[test]
    fn duplicate_snapshot_timestamp_conflicts() {
        let (catalog, alice) = setup();
        let video = testing::video(&mut catalog.lock(), alice, "abc123");
        let at = now();
        catalog.lock().insert_view_counts(&[(video, 1)], at).unwrap();
        let err = catalog.lock().insert_view_counts(&[(video, 2)], at).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn categories_sync_and_category_ingest() {
        let mut catalog = testing::catalog();
        let alice = testing::user(&mut catalog, "alice");
        let mut api = FakeApi::default()
            .with_video("m1", "10", &[])
            .with_video("m2", "10", &[])
            .with_video("c1", "23", &[]);
        api.categories = vec![
            Category {
                id: "10".into(),
                title: "Music".into(),
            },
            Category {
                id: "23".into(),
                title: "Comedy".into(),
            },
        ];

        let categories = sync_categories(&mut catalog, &api, "US").unwrap();
        assert_eq!(categories.len(), 2);

        let catalog = Mutex::new(catalog);
        let videos = ingest_category(&catalog, &api, alice, "10", 50).unwrap();
        let ids: Vec<_> = videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
    }
}
