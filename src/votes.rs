//! Video and comment votes.
//!
//! Casting a vote is a strict insert: the `(target, voter)` unique index turns
//! a second vote into `CatalogError::Conflict`. Changing an existing vote is a
//! separate, explicit operation.

use rusqlite::{Connection, params};

use crate::catalog::{Catalog, CommentId, UserId, VideoId};
use crate::error::{CatalogError, CatalogResult};

/// Value of the vote authors cast on their own submissions.
pub const SELF_VOTE: i64 = 1;

pub(crate) fn insert_video_vote(
    conn: &Connection,
    video: VideoId,
    voter: UserId,
    value: i64,
) -> CatalogResult<()> {
    conn.prepare_cached("INSERT INTO video_votes (video_id, voter_id, value) VALUES (?1, ?2, ?3)")?
        .execute(params![video, voter, value])?;
    Ok(())
}

pub(crate) fn insert_comment_vote(
    conn: &Connection,
    comment: CommentId,
    voter: UserId,
    value: i64,
) -> CatalogResult<()> {
    conn.prepare_cached(
        "INSERT INTO comment_votes (comment_id, voter_id, value) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![comment, voter, value])?;
    Ok(())
}

fn check_comment_vote(value: i64) -> CatalogResult<()> {
    if value == 1 || value == -1 {
        Ok(())
    } else {
        Err(CatalogError::Invalid(format!(
            "comment votes must be 1 or -1, got {value}"
        )))
    }
}

impl Catalog {
    pub fn vote_video(&mut self, video: VideoId, voter: UserId, value: i64) -> CatalogResult<()> {
        self.ensure_exists("videos", "video", video)?;
        self.ensure_exists("users", "user", voter)?;
        insert_video_vote(&self.conn, video, voter, value).map_err(|err| match err {
            CatalogError::Conflict(_) => {
                CatalogError::Conflict(format!("user {voter} already voted on video {video}"))
            }
            other => other,
        })
    }

    pub fn change_video_vote(
        &mut self,
        video: VideoId,
        voter: UserId,
        value: i64,
    ) -> CatalogResult<()> {
        let changed = self.conn.execute(
            "UPDATE video_votes SET value = ?3 WHERE video_id = ?1 AND voter_id = ?2",
            params![video, voter, value],
        )?;
        if changed == 0 {
            return Err(CatalogError::not_found(
                "video vote",
                format!("{video}/{voter}"),
            ));
        }
        Ok(())
    }

    pub fn vote_comment(
        &mut self,
        comment: CommentId,
        voter: UserId,
        value: i64,
    ) -> CatalogResult<()> {
        check_comment_vote(value)?;
        self.ensure_exists("comments", "comment", comment)?;
        self.ensure_exists("users", "user", voter)?;
        insert_comment_vote(&self.conn, comment, voter, value).map_err(|err| match err {
            CatalogError::Conflict(_) => CatalogError::Conflict(format!(
                "user {voter} already voted on comment {comment}"
            )),
            other => other,
        })
    }

    pub fn change_comment_vote(
        &mut self,
        comment: CommentId,
        voter: UserId,
        value: i64,
    ) -> CatalogResult<()> {
        check_comment_vote(value)?;
        let changed = self.conn.execute(
            "UPDATE comment_votes SET value = ?3 WHERE comment_id = ?1 AND voter_id = ?2",
            params![comment, voter, value],
        )?;
        if changed == 0 {
            return Err(CatalogError::not_found(
                "comment vote",
                format!("{comment}/{voter}"),
            ));
        }
        Ok(())
    }

    pub fn video_score(&self, video: VideoId) -> CatalogResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(value), 0) FROM video_votes WHERE video_id = ?1",
            [video],
            |row| row.get(0),
        )?)
    }

    pub fn comment_score(&self, comment: CommentId) -> CatalogResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(value), 0) FROM comment_votes WHERE comment_id = ?1",
            [comment],
            |row| row.get(0),
        )?)
    }
}
