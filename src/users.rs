//! Accounts, profiles and the follow/favorite relationships hanging off them.

use rusqlite::{OptionalExtension, params};
use serde::Deserialize;

use crate::catalog::{
    Badge, BadgeId, Catalog, Category, Profile, Tag, TagId, User, UserId, VIDEO_COLUMNS, Video,
    VideoId, format_timestamp, now, row_to_video, timestamp_column,
};
use crate::error::{CatalogError, CatalogResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl Catalog {
    /// Creates the user together with its (empty) profile. Both rows land in
    /// the same transaction, so a user never exists without a profile.
    pub fn create_user(&mut self, new_user: NewUser) -> CatalogResult<User> {
        let username = new_user.username.trim();
        if username.is_empty() {
            return Err(CatalogError::Invalid("username must not be empty".into()));
        }
        let joined = now();

        let tx = self.write_tx()?;
        tx.execute(
            r#"
            INSERT INTO users (username, email, first_name, last_name, joined)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                username,
                new_user.email,
                new_user.first_name,
                new_user.last_name,
                format_timestamp(joined),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute("INSERT INTO profiles (user_id) VALUES (?1)", [id])?;
        tx.commit()?;

        log::debug!("created user {id} ({username})");
        self.user(id)
    }

    pub fn user(&self, id: UserId) -> CatalogResult<User> {
        self.conn
            .query_row(
                r#"
                SELECT id, username, email, first_name, last_name, email_verified, joined
                FROM users
                WHERE id = ?1
                "#,
                [id],
                |row| {
                    Ok(User {
                        id: row.get("id")?,
                        username: row.get("username")?,
                        email: row.get("email")?,
                        first_name: row.get("first_name")?,
                        last_name: row.get("last_name")?,
                        email_verified: row.get::<_, i64>("email_verified")? != 0,
                        joined: timestamp_column(row, "joined")?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::not_found("user", id))
    }

    pub fn mark_email_verified(&mut self, id: UserId) -> CatalogResult<()> {
        let changed = self
            .conn
            .execute("UPDATE users SET email_verified = 1 WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(CatalogError::not_found("user", id));
        }
        Ok(())
    }

    pub fn profile(&self, user_id: UserId) -> CatalogResult<Profile> {
        let (blurb, website) = self
            .conn
            .query_row(
                "SELECT blurb, website FROM profiles WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or_else(|| CatalogError::not_found("profile", user_id))?;
        Ok(Profile {
            user_id,
            blurb,
            website,
            badges: self.badges(user_id)?,
        })
    }

    pub fn update_profile(
        &mut self,
        user_id: UserId,
        blurb: &str,
        website: &str,
    ) -> CatalogResult<Profile> {
        let changed = self.conn.execute(
            "UPDATE profiles SET blurb = ?2, website = ?3 WHERE user_id = ?1",
            params![user_id, blurb, website],
        )?;
        if changed == 0 {
            return Err(CatalogError::not_found("profile", user_id));
        }
        self.profile(user_id)
    }

    pub fn create_badge(&mut self, title: &str, description: &str) -> CatalogResult<Badge> {
        self.conn.execute(
            "INSERT INTO badges (title, description) VALUES (?1, ?2)",
            params![title, description],
        )?;
        Ok(Badge {
            id: self.conn.last_insert_rowid(),
            title: title.to_string(),
            description: description.to_string(),
        })
    }

    pub fn award_badge(&mut self, user_id: UserId, badge_id: BadgeId) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO profile_badges (user_id, badge_id) VALUES (?1, ?2)",
            params![user_id, badge_id],
        )?;
        Ok(())
    }

    pub fn badges(&self, user_id: UserId) -> CatalogResult<Vec<Badge>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT b.id, b.title, b.description
            FROM badges b
            JOIN profile_badges pb ON pb.badge_id = b.id
            WHERE pb.user_id = ?1
            ORDER BY b.id ASC
            "#,
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(Badge {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Adds a directed follow edge. Following someone twice is a no-op.
    pub fn follow_user(&mut self, follower: UserId, followee: UserId) -> CatalogResult<()> {
        if follower == followee {
            return Err(CatalogError::Invalid("users cannot follow themselves".into()));
        }
        self.ensure_exists("users", "user", follower)?;
        self.ensure_exists("users", "user", followee)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO user_following (follower_id, followee_id) VALUES (?1, ?2)",
            params![follower, followee],
        )?;
        Ok(())
    }

    pub fn unfollow_user(&mut self, follower: UserId, followee: UserId) -> CatalogResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM user_following WHERE follower_id = ?1 AND followee_id = ?2",
            params![follower, followee],
        )?;
        Ok(removed > 0)
    }

    /// Users that `user` follows.
    pub fn following(&self, user: UserId) -> CatalogResult<Vec<UserId>> {
        self.edge_targets(
            "SELECT followee_id FROM user_following WHERE follower_id = ?1 ORDER BY followee_id",
            user,
        )
    }

    /// Users following `user`.
    pub fn followers(&self, user: UserId) -> CatalogResult<Vec<UserId>> {
        self.edge_targets(
            "SELECT follower_id FROM user_following WHERE followee_id = ?1 ORDER BY follower_id",
            user,
        )
    }

    pub fn follow_category(&mut self, user: UserId, category_id: &str) -> CatalogResult<()> {
        self.ensure_exists("users", "user", user)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO category_followers (category_id, user_id) VALUES (?1, ?2)",
            params![category_id, user],
        )?;
        Ok(())
    }

    pub fn followed_categories(&self, user: UserId) -> CatalogResult<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.id, c.title
            FROM categories c
            JOIN category_followers f ON f.category_id = c.id
            WHERE f.user_id = ?1
            ORDER BY c.title ASC
            "#,
        )?;
        let rows = stmt.query_map([user], |row| {
            Ok(Category {
                id: row.get(0)?,
                title: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn follow_tag(&mut self, user: UserId, tag: TagId) -> CatalogResult<()> {
        self.ensure_exists("users", "user", user)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO tag_followers (tag_id, user_id) VALUES (?1, ?2)",
            params![tag, user],
        )?;
        Ok(())
    }

    pub fn followed_tags(&self, user: UserId) -> CatalogResult<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.id, t.title
            FROM tags t
            JOIN tag_followers f ON f.tag_id = t.id
            WHERE f.user_id = ?1
            ORDER BY t.title ASC
            "#,
        )?;
        let rows = stmt.query_map([user], |row| {
            Ok(Tag {
                id: row.get(0)?,
                title: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn favorite_video(&mut self, user: UserId, video: VideoId) -> CatalogResult<()> {
        self.ensure_exists("users", "user", user)?;
        self.ensure_exists("videos", "video", video)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO video_favorites (video_id, user_id) VALUES (?1, ?2)",
            params![video, user],
        )?;
        Ok(())
    }

    pub fn favorite_videos(&self, user: UserId) -> CatalogResult<Vec<Video>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"{VIDEO_COLUMNS}
            WHERE id IN (SELECT video_id FROM video_favorites WHERE user_id = ?1)
            ORDER BY id ASC
            "#
        ))?;
        let videos = stmt
            .query_map([user], row_to_video)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        videos
            .into_iter()
            .map(|video| self.with_tags(video))
            .collect()
    }

    fn edge_targets(&self, sql: &str, id: i64) -> CatalogResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::testing;
    use crate::error::CatalogError;

    use super::*;

    #[test]
    fn create_user_also_creates_profile() {
        let mut catalog = testing::catalog();
        let id = testing::user(&mut catalog, "alice");
        let profile = catalog.profile(id).unwrap();
        assert_eq!(profile.user_id, id);
        assert!(profile.blurb.is_empty());
        assert!(profile.badges.is_empty());
        assert!(!catalog.user(id).unwrap().email_verified);
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let mut catalog = testing::catalog();
        testing::user(&mut catalog, "alice");
        let err = catalog
            .create_user(NewUser {
                username: "alice".into(),
                ..NewUser::default()
            })
            .unwrap_err();
        assert!(err.is_conflict());
        let profiles: i64 = catalog
            .conn
            .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(profiles, 1);
    }

    #[test]
    fn following_is_asymmetric_and_idempotent() {
        let mut catalog = testing::catalog();
        let alice = testing::user(&mut catalog, "alice");
        let bob = testing::user(&mut catalog, "bob");
        catalog.follow_user(alice, bob).unwrap();
        catalog.follow_user(alice, bob).unwrap();
        assert_eq!(catalog.following(alice).unwrap(), vec![bob]);
        assert_eq!(catalog.followers(bob).unwrap(), vec![alice]);
        assert!(catalog.following(bob).unwrap().is_empty());
        assert!(catalog.unfollow_user(alice, bob).unwrap());
        assert!(catalog.following(alice).unwrap().is_empty());
    }

    #[test]
    fn following_rejects_self_and_unknown_users() {
        let mut catalog = testing::catalog();
        let alice = testing::user(&mut catalog, "alice");
        assert!(matches!(
            catalog.follow_user(alice, alice),
            Err(CatalogError::Invalid(_))
        ));
        assert!(matches!(
            catalog.follow_user(alice, 404),
            Err(CatalogError::NotFound { kind: "user", .. })
        ));
    }

    #[test]
    fn badges_and_profile_updates() {
        let mut catalog = testing::catalog();
        let alice = testing::user(&mut catalog, "alice");
        let badge = catalog.create_badge("Curator", "Submitted ten videos").unwrap();
        catalog.award_badge(alice, badge.id).unwrap();
        catalog.award_badge(alice, badge.id).unwrap();
        let profile = catalog
            .update_profile(alice, "I like music", "https://example.com")
            .unwrap();
        assert_eq!(profile.blurb, "I like music");
        assert_eq!(profile.badges, vec![badge]);
    }

    #[test]
    fn follows_categories_tags_and_favorites() {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "10", "Music");
        let alice = testing::user(&mut catalog, "alice");
        let video = testing::video(&mut catalog, alice, "abc123");
        let tags = catalog.resolve_tags(&["jazz".to_string()]).unwrap();

        catalog.follow_category(alice, "10").unwrap();
        catalog.follow_tag(alice, tags[0]).unwrap();
        catalog.favorite_video(alice, video).unwrap();

        assert_eq!(catalog.followed_categories(alice).unwrap()[0].title, "Music");
        assert_eq!(catalog.followed_tags(alice).unwrap()[0].title, "jazz");
        assert_eq!(catalog.favorite_videos(alice).unwrap()[0].video_id, "abc123");
        assert!(matches!(
            catalog.follow_category(alice, "999"),
            Err(CatalogError::MissingReference(_))
        ));
    }
}
