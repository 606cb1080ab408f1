//! Ordered video listings.
//!
//! Scores are aggregated from the vote and view count rows on every query;
//! there are no running counters to keep in sync.

use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Video, VideoId, row_to_video};
use crate::error::{CatalogError, CatalogResult};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoOrdering {
    /// Sum of vote values.
    #[default]
    Likes,
    /// Highest recorded view count.
    Views,
    /// When the video was added to the catalogue.
    Submission,
    /// When the video was published on the hosting platform.
    Publication,
}

impl VideoOrdering {
    pub const ALL: [VideoOrdering; 4] = [
        VideoOrdering::Likes,
        VideoOrdering::Views,
        VideoOrdering::Submission,
        VideoOrdering::Publication,
    ];

    /// Unknown keywords fall back to `Likes`.
    pub fn from_keyword(keyword: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|ordering| ordering.keyword().eq_ignore_ascii_case(keyword.trim()))
            .unwrap_or_default()
    }

    pub fn keyword(self) -> &'static str {
        match self {
            VideoOrdering::Likes => "likes",
            VideoOrdering::Views => "views",
            VideoOrdering::Submission => "submission",
            VideoOrdering::Publication => "publication",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            VideoOrdering::Likes => "Most Liked Videos",
            VideoOrdering::Views => "Most Viewed Videos",
            VideoOrdering::Submission => "Most Recent User Submissions",
            VideoOrdering::Publication => "Most Recently Published Videos",
        }
    }

    fn sort_expression(self) -> &'static str {
        match self {
            VideoOrdering::Likes => "score",
            VideoOrdering::Views => "max_views",
            VideoOrdering::Submission => "v.created",
            VideoOrdering::Publication => "v.published",
        }
    }
}

/// 1-based page selector. Built through `Page::new`, which clamps both
/// values into range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    number: u32,
    size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number: number.max(1),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn number(self) -> u32 {
        self.number
    }

    pub fn size(self) -> u32 {
        self.size
    }

    fn offset(self) -> u64 {
        u64::from(self.number.saturating_sub(1)) * u64::from(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoSummary {
    /// Position in the listing, counting from 1 across pages.
    pub rank: u64,
    #[serde(flatten)]
    pub video: Video,
    pub score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_views: Option<i64>,
}

const RANKED_COLUMNS: &str = r#"
    SELECT v.id, v.video_id, v.title, v.description, v.published, v.created, v.updated,
           v.category_id, v.uploader_id,
           COALESCE((SELECT SUM(vv.value) FROM video_votes vv WHERE vv.video_id = v.id), 0)
               AS score,
           (SELECT MAX(vc.views) FROM view_counts vc WHERE vc.video_id = v.id) AS max_views
    FROM videos v
"#;

fn row_to_ranked(row: &Row<'_>) -> rusqlite::Result<(Video, i64, Option<i64>)> {
    Ok((row_to_video(row)?, row.get("score")?, row.get("max_views")?))
}

impl Catalog {
    pub fn list_videos(
        &self,
        ordering: VideoOrdering,
        descending: bool,
        page: Page,
    ) -> CatalogResult<Vec<VideoSummary>> {
        let direction = if descending { "DESC" } else { "ASC" };
        let sql = format!(
            "{RANKED_COLUMNS} ORDER BY {} {direction}, v.id ASC LIMIT ?1 OFFSET ?2",
            ordering.sort_expression()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![i64::from(page.size), page.offset() as i64],
                row_to_ranked,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .enumerate()
            .map(|(index, (video, score, max_views))| -> CatalogResult<VideoSummary> {
                Ok(VideoSummary {
                    rank: page.offset() + index as u64 + 1,
                    video: self.with_tags(video)?,
                    score,
                    max_views,
                })
            })
            .collect()
    }

    pub fn most_liked(&self, limit: u32) -> CatalogResult<Vec<VideoSummary>> {
        self.list_videos(VideoOrdering::Likes, true, Page::new(1, limit))
    }

    pub fn video_summary(&self, id: VideoId) -> CatalogResult<VideoSummary> {
        let (video, score, max_views) = self
            .conn
            .query_row(&format!("{RANKED_COLUMNS} WHERE v.id = ?1"), [id], row_to_ranked)
            .optional()?
            .ok_or_else(|| CatalogError::not_found("video", id))?;
        Ok(VideoSummary {
            rank: 1,
            video: self.with_tags(video)?,
            score,
            max_views,
        })
    }
}
