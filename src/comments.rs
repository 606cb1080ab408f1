//! Threaded comments.
//!
//! Comments reference their parent by id (`parent_id` is an edge, not an
//! owned child list). Trees are assembled on read by walking those edges.

use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use crate::catalog::{
    Catalog, Comment, CommentId, UserId, VideoId, format_timestamp, now, timestamp_column,
};
use crate::error::{CatalogError, CatalogResult};
use crate::votes::{SELF_VOTE, insert_comment_vote};

/// One node of an expanded comment tree. Comments without children (or
/// beyond the depth limit) are plain leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommentNode {
    Leaf(Comment),
    Branch {
        comment: Comment,
        children: Vec<CommentNode>,
    },
}

impl CommentNode {
    pub fn comment(&self) -> &Comment {
        match self {
            CommentNode::Leaf(comment) => comment,
            CommentNode::Branch { comment, .. } => comment,
        }
    }

    pub fn children(&self) -> &[CommentNode] {
        match self {
            CommentNode::Leaf(_) => &[],
            CommentNode::Branch { children, .. } => children,
        }
    }
}

const COMMENT_COLUMNS: &str = r#"
    SELECT c.id, c.video_id, c.commenter_id, c.parent_id, c.text, c.created,
           COALESCE((SELECT SUM(v.value) FROM comment_votes v WHERE v.comment_id = c.id), 0)
               AS score
    FROM comments c
"#;

fn row_to_comment(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get("id")?,
        video_id: row.get("video_id")?,
        commenter_id: row.get("commenter_id")?,
        parent_id: row.get("parent_id")?,
        text: row.get("text")?,
        created: timestamp_column(row, "created")?,
        score: row.get("score")?,
    })
}

impl Catalog {
    /// Stores a comment and the author's self-vote in one transaction.
    pub fn create_comment(
        &mut self,
        video: VideoId,
        commenter: UserId,
        parent: Option<CommentId>,
        text: &str,
    ) -> CatalogResult<Comment> {
        if text.trim().is_empty() {
            return Err(CatalogError::Invalid("comment text must not be empty".into()));
        }
        self.ensure_exists("videos", "video", video)?;
        self.ensure_exists("users", "user", commenter)?;
        if let Some(parent) = parent {
            let parent_video: VideoId = self
                .conn
                .query_row(
                    "SELECT video_id FROM comments WHERE id = ?1",
                    [parent],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| CatalogError::not_found("comment", parent))?;
            if parent_video != video {
                return Err(CatalogError::Invalid(format!(
                    "parent comment {parent} belongs to video {parent_video}, not {video}"
                )));
            }
        }

        let tx = self.write_tx()?;
        tx.execute(
            r#"
            INSERT INTO comments (video_id, commenter_id, parent_id, text, created)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![video, commenter, parent, text, format_timestamp(now())],
        )?;
        let id = tx.last_insert_rowid();
        insert_comment_vote(&tx, id, commenter, SELF_VOTE)?;
        tx.commit()?;

        self.comment(id)
    }

    pub fn comment(&self, id: CommentId) -> CatalogResult<Comment> {
        self.conn
            .query_row(
                &format!("{COMMENT_COLUMNS} WHERE c.id = ?1"),
                [id],
                row_to_comment,
            )
            .optional()?
            .ok_or_else(|| CatalogError::not_found("comment", id))
    }

    /// Top-level comments of a video, highest score first.
    pub fn root_comments(&self, video: VideoId) -> CatalogResult<Vec<Comment>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{COMMENT_COLUMNS} WHERE c.video_id = ?1 AND c.parent_id IS NULL
             ORDER BY score DESC, c.id ASC"
        ))?;
        let rows = stmt.query_map([video], row_to_comment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Direct replies to a comment, highest score first.
    pub fn direct_children(&self, parent: CommentId) -> CatalogResult<Vec<Comment>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{COMMENT_COLUMNS} WHERE c.parent_id = ?1 ORDER BY score DESC, c.id ASC"
        ))?;
        let rows = stmt.query_map([parent], row_to_comment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Expands the replies of `parent`.
    ///
    /// With `depth = None` the whole subtree is expanded. `Some(0)` returns
    /// the direct replies as leaves; every extra level of depth expands one
    /// more generation below them.
    pub fn comment_children(
        &self,
        parent: CommentId,
        depth: Option<u32>,
    ) -> CatalogResult<Vec<CommentNode>> {
        self.ensure_exists("comments", "comment", parent)?;
        self.expand(self.direct_children(parent)?, depth)
    }

    /// Root comments of a video, each expanded like `comment_children`.
    pub fn comment_forest(
        &self,
        video: VideoId,
        depth: Option<u32>,
    ) -> CatalogResult<Vec<CommentNode>> {
        self.ensure_exists("videos", "video", video)?;
        self.root_comments(video)?
            .into_iter()
            .map(|root| -> CatalogResult<CommentNode> {
                let children = self.expand_level(root.id, depth)?;
                Ok(match children {
                    Some(children) => CommentNode::Branch {
                        comment: root,
                        children,
                    },
                    None => CommentNode::Leaf(root),
                })
            })
            .collect()
    }

    fn expand(
        &self,
        comments: Vec<Comment>,
        depth: Option<u32>,
    ) -> CatalogResult<Vec<CommentNode>> {
        let next = match depth {
            Some(0) => return Ok(comments.into_iter().map(CommentNode::Leaf).collect()),
            Some(depth) => Some(depth - 1),
            None => None,
        };
        comments
            .into_iter()
            .map(|comment| -> CatalogResult<CommentNode> {
                let grandchildren = self.direct_children(comment.id)?;
                if grandchildren.is_empty() {
                    Ok(CommentNode::Leaf(comment))
                } else {
                    Ok(CommentNode::Branch {
                        comment,
                        children: self.expand(grandchildren, next)?,
                    })
                }
            })
            .collect()
    }

    /// Children of `parent` expanded to `depth`, or `None` when it has none.
    fn expand_level(
        &self,
        parent: CommentId,
        depth: Option<u32>,
    ) -> CatalogResult<Option<Vec<CommentNode>>> {
        let children = self.direct_children(parent)?;
        if children.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.expand(children, depth)?))
    }
}
