//! Find-or-create resolution of freeform tag titles.

use std::collections::HashSet;

use rusqlite::{Connection, params};

use crate::catalog::{Catalog, TagId, VideoId};
use crate::error::CatalogResult;

/// Trims, drops blanks and removes duplicates while keeping first-seen order.
pub fn normalize_titles<S: AsRef<str>>(titles: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    titles
        .iter()
        .map(|title| title.as_ref().trim())
        .filter(|title| !title.is_empty())
        .filter(|title| seen.insert(title.to_string()))
        .map(str::to_string)
        .collect()
}

/// Inserts the missing titles and returns the ids of every requested title.
///
/// `ON CONFLICT DO NOTHING` makes a concurrent insert of the same title by
/// another writer harmless: the unique index arbitrates, and the follow-up
/// select sees whichever row won.
pub(crate) fn resolve_in(conn: &Connection, titles: &[String]) -> CatalogResult<Vec<TagId>> {
    let mut insert =
        conn.prepare_cached("INSERT INTO tags (title) VALUES (?1) ON CONFLICT(title) DO NOTHING")?;
    let mut select = conn.prepare_cached("SELECT id FROM tags WHERE title = ?1")?;
    let mut ids = Vec::with_capacity(titles.len());
    for title in titles {
        insert.execute([title])?;
        ids.push(select.query_row([title], |row| row.get(0))?);
    }
    Ok(ids)
}

pub(crate) fn attach_in(conn: &Connection, video: VideoId, tags: &[TagId]) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached("INSERT OR IGNORE INTO video_tags (video_id, tag_id) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![video, tag])?;
    }
    Ok(())
}

impl Catalog {
    pub fn resolve_tags<S: AsRef<str>>(&mut self, titles: &[S]) -> CatalogResult<Vec<TagId>> {
        let titles = normalize_titles(titles);
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.write_tx()?;
        let ids = resolve_in(&tx, &titles)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Resolves `titles` and associates all of them with `video`.
    pub fn tag_video<S: AsRef<str>>(
        &mut self,
        video: VideoId,
        titles: &[S],
    ) -> CatalogResult<Vec<TagId>> {
        self.ensure_exists("videos", "video", video)?;
        let titles = normalize_titles(titles);
        let tx = self.write_tx()?;
        let ids = resolve_in(&tx, &titles)?;
        attach_in(&tx, video, &ids)?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn video_tags(&self, video: VideoId) -> CatalogResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT t.title
            FROM tags t
            JOIN video_tags vt ON vt.tag_id = t.id
            WHERE vt.video_id = ?1
            ORDER BY t.title ASC
            "#,
        )?;
        let rows = stmt.query_map([video], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tag_count(&self) -> CatalogResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tempfile::tempdir;

    use crate::catalog::testing;

    use super::*;

    #[test]
    fn normalize_titles_dedupes_and_trims() {
        let titles = normalize_titles(&[" jazz", "jazz", "", "  ", "blues", "jazz "]);
        assert_eq!(titles, ["jazz", "blues"]);
    }

    #[test]
    fn resolve_tags_reuses_existing_rows() {
        let mut catalog = testing::catalog();
        let first = catalog.resolve_tags(&["jazz", "blues"]).unwrap();
        let second = catalog.resolve_tags(&["blues", "funk", "blues"]).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[1]);
        assert_eq!(catalog.tag_count().unwrap(), 3);
    }

    #[test]
    fn tag_video_associates_full_set_once() {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "10", "Music");
        let alice = testing::user(&mut catalog, "alice");
        let video = testing::video(&mut catalog, alice, "abc123");
        catalog.resolve_tags(&["jazz"]).unwrap();
        catalog.tag_video(video, &["jazz", "piano"]).unwrap();
        catalog.tag_video(video, &["piano"]).unwrap();
        assert_eq!(catalog.video_tags(video).unwrap(), ["jazz", "piano"]);
    }

    #[test]
    fn concurrent_resolution_creates_one_row_per_title() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.db");
        Catalog::open(&path).unwrap();

        let titles: Vec<String> = (0..50).map(|i| format!("tag-{i}")).collect();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let titles = titles.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut catalog = Catalog::open(&path).unwrap();
                    barrier.wait();
                    catalog.resolve_tags(&titles).unwrap()
                })
            })
            .collect();
        let results: Vec<Vec<TagId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0], results[1]);
        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.tag_count().unwrap(), 50);
    }
}
