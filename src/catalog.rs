//! SQLite persistence layer for the catalogue.
//!
//! `Catalog` owns a single connection. Operations on it are spread across the
//! sibling modules (`users`, `tags`, `votes`, `ranking`, `comments`, `ingest`)
//! as separate `impl Catalog` blocks; this file holds the schema, the record
//! types shared by all of them, and the row converters.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type UserId = i64;
pub type VideoId = i64;
pub type TagId = i64;
pub type CommentId = i64;
pub type BadgeId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    pub email_verified: bool,
    pub joined: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub id: BadgeId,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub blurb: String,
    pub website: String,
    #[serde(default)]
    pub badges: Vec<Badge>,
}

/// Categories keep YouTube's own id as primary key. Titles are not unique
/// (YouTube ships two "Comedy" categories).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    /// External identifier on the hosting platform.
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub published: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub category_id: String,
    pub uploader_id: UserId,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewCount {
    pub video_id: VideoId,
    pub counted_at: DateTime<Utc>,
    pub views: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub video_id: VideoId,
    pub commenter_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,
    pub text: String,
    pub created: DateTime<Utc>,
    /// Sum of vote values at the time the row was read.
    pub score: i64,
}

/// Wrapper around the SQLite connection that performs read/write operations.
#[derive(Debug)]
pub struct Catalog {
    pub(crate) conn: Connection,
}

impl Catalog {
    /// Opens (and if necessary creates) the database and ensures the schema
    /// exists. WAL mode keeps readers from blocking the ingestion writer.
    pub fn open(path: &Path) -> CatalogResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
                context: format!("creating database directory {}", parent.display()),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> CatalogResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CatalogResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut catalog = Self { conn };
        catalog.ensure_tables()?;
        Ok(catalog)
    }

    /// Write transactions take the database lock up front so two writers
    /// never deadlock upgrading a shared lock.
    pub(crate) fn write_tx(&mut self) -> CatalogResult<rusqlite::Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    fn ensure_tables(&mut self) -> CatalogResult<()> {
        let tx = self.conn.transaction()?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL DEFAULT '',
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                email_verified INTEGER NOT NULL DEFAULT 0,
                joined TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS profiles (
                user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                blurb TEXT NOT NULL DEFAULT '',
                website TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS badges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS profile_badges (
                user_id INTEGER NOT NULL REFERENCES profiles(user_id) ON DELETE CASCADE,
                badge_id INTEGER NOT NULL REFERENCES badges(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, badge_id)
            );

            CREATE TABLE IF NOT EXISTS user_following (
                follower_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                followee_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (follower_id, followee_id),
                CHECK (follower_id <> followee_id)
            );

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS category_followers (
                category_id TEXT NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (category_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS tag_followers (
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (tag_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                published TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                category_id TEXT NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                uploader_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS video_tags (
                video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (video_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS video_favorites (
                video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (video_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS video_votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                voter_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                value INTEGER NOT NULL,
                UNIQUE (video_id, voter_id)
            );

            CREATE TABLE IF NOT EXISTS view_counts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                counted_at TEXT NOT NULL,
                views INTEGER NOT NULL,
                UNIQUE (video_id, counted_at)
            );

            CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                commenter_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                parent_id INTEGER REFERENCES comments(id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS comment_votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                comment_id INTEGER NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
                voter_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                value INTEGER NOT NULL,
                UNIQUE (comment_id, voter_id)
            );

            CREATE INDEX IF NOT EXISTS idx_videos_category ON videos(category_id);
            CREATE INDEX IF NOT EXISTS idx_video_votes_video ON video_votes(video_id);
            CREATE INDEX IF NOT EXISTS idx_view_counts_video ON view_counts(video_id);
            CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);
            CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_id);
            CREATE INDEX IF NOT EXISTS idx_comment_votes_comment ON comment_votes(comment_id);
            "#,
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn upsert_categories(&mut self, categories: &[Category]) -> CatalogResult<usize> {
        let tx = self.write_tx()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO categories (id, title) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET title = excluded.title
                "#,
            )?;
            for category in categories {
                stmt.execute(params![category.id, category.title])?;
            }
        }
        tx.commit()?;
        Ok(categories.len())
    }

    pub fn categories(&self) -> CatalogResult<Vec<Category>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title FROM categories ORDER BY title ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Category {
                id: row.get("id")?,
                title: row.get("title")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn video(&self, id: VideoId) -> CatalogResult<Video> {
        let mut stmt = self.conn.prepare(&format!("{VIDEO_COLUMNS} WHERE id = ?1"))?;
        let video = stmt
            .query_row([id], row_to_video)
            .optional()?
            .ok_or_else(|| CatalogError::not_found("video", id))?;
        self.with_tags(video)
    }

    pub fn video_by_external_id(&self, video_id: &str) -> CatalogResult<Option<Video>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{VIDEO_COLUMNS} WHERE video_id = ?1"))?;
        match stmt.query_row([video_id], row_to_video).optional()? {
            Some(video) => Ok(Some(self.with_tags(video)?)),
            None => Ok(None),
        }
    }

    /// Stored videos for the given external ids, in the order requested.
    /// Unknown ids are skipped.
    pub fn videos_by_external_ids(&self, video_ids: &[String]) -> CatalogResult<Vec<Video>> {
        let mut videos = Vec::with_capacity(video_ids.len());
        let mut seen = std::collections::HashSet::new();
        for video_id in video_ids {
            if !seen.insert(video_id.as_str()) {
                continue;
            }
            if let Some(video) = self.video_by_external_id(video_id)? {
                videos.push(video);
            }
        }
        Ok(videos)
    }

    pub fn view_counts(&self, video: VideoId) -> CatalogResult<Vec<ViewCount>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT video_id, counted_at, views
            FROM view_counts
            WHERE video_id = ?1
            ORDER BY counted_at ASC
            "#,
        )?;
        let rows = stmt.query_map([video], |row| {
            Ok(ViewCount {
                video_id: row.get("video_id")?,
                counted_at: timestamp_column(row, "counted_at")?,
                views: row.get("views")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub(crate) fn with_tags(&self, mut video: Video) -> CatalogResult<Video> {
        video.tags = self.video_tags(video.id)?;
        Ok(video)
    }

    pub(crate) fn ensure_exists(
        &self,
        table: &'static str,
        kind: &'static str,
        id: i64,
    ) -> CatalogResult<()> {
        let found: Option<i64> = self
            .conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |row| {
                row.get(0)
            })
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(CatalogError::not_found(kind, id)),
        }
    }
}

pub(crate) const VIDEO_COLUMNS: &str = r#"
    SELECT id, video_id, title, description, published, created, updated,
           category_id, uploader_id
    FROM videos
"#;

/// Timestamps are stored as fixed-width RFC 3339 text so lexical order
/// matches chronological order.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn timestamp_column(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

/// Converts a SQL row into a `Video` without its tags.
pub(crate) fn row_to_video(row: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get("id")?,
        video_id: row.get("video_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        published: timestamp_column(row, "published")?,
        created: timestamp_column(row, "created")?,
        updated: timestamp_column(row, "updated")?,
        category_id: row.get("category_id")?,
        uploader_id: row.get("uploader_id")?,
        tags: Vec::new(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");
        Catalog::open(&path).unwrap();
        assert!(path.exists());
        // Reopening an existing database keeps the schema intact.
        Catalog::open(&path).unwrap();
    }

    #[test]
    fn unusable_directory_is_an_io_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let err = Catalog::open(&blocker.join("catalog.db")).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }), "{err:?}");
        assert!(err.to_string().contains("creating database directory"));
    }

    #[test]
    fn upsert_categories_updates_titles() {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "23", "Comedy");
        testing::category(&mut catalog, "34", "Comedy");
        testing::category(&mut catalog, "23", "Stand-up");
        let categories = catalog.categories().unwrap();
        assert_eq!(categories.len(), 2);
        assert!(categories.iter().any(|c| c.id == "23" && c.title == "Stand-up"));
    }

    #[test]
    fn video_lookup_reports_missing_rows() {
        let catalog = testing::catalog();
        let err = catalog.video(99).unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { kind: "video", .. }));
        assert!(catalog.video_by_external_id("nope").unwrap().is_none());
    }

    #[test]
    fn videos_by_external_ids_keeps_request_order() {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "10", "Music");
        let user = testing::user(&mut catalog, "alice");
        testing::video(&mut catalog, user, "aaa");
        testing::video(&mut catalog, user, "bbb");
        let ids = vec![
            "bbb".to_string(),
            "zzz".to_string(),
            "aaa".to_string(),
            "bbb".to_string(),
        ];
        let videos = catalog.videos_by_external_ids(&ids).unwrap();
        let order: Vec<_> = videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(order, ["bbb", "aaa"]);
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let stamp = now();
        let text = format_timestamp(stamp);
        let parsed = DateTime::parse_from_rfc3339(&text).unwrap();
        assert_eq!(parsed.timestamp_micros(), stamp.timestamp_micros());
        assert!(text.ends_with('Z'));
    }
}
