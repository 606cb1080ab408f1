use std::collections::HashSet;

use crate::catalog::Catalog;
use crate::error::CatalogResult;

/// Removes repeated and blank ids, keeping the first occurrence of each.
pub fn unique_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.as_ref().trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

impl Catalog {
    /// The subset of `ids` with no stored video yet.
    pub fn missing_video_ids<S: AsRef<str>>(&self, ids: &[S]) -> CatalogResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM videos WHERE video_id = ?1)")?;
        let mut missing = Vec::new();
        for id in unique_ids(ids) {
            let exists: bool = stmt.query_row([&id], |row| row.get(0))?;
            if !exists {
                missing.push(id);
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::testing;

    use super::*;

    #[test]
    fn unique_ids_keeps_first_occurrence() {
        assert_eq!(unique_ids(&["b", "a", "b", " ", "a", "c"]), ["b", "a", "c"]);
    }

    #[test]
    fn missing_video_ids_drops_stored_ids() {
        let mut catalog = testing::catalog();
        testing::category(&mut catalog, "10", "Music");
        let alice = testing::user(&mut catalog, "alice");
        testing::video(&mut catalog, alice, "abc123");
        let missing = catalog
            .missing_video_ids(&["abc123", "xyz789", "xyz789"])
            .unwrap();
        assert_eq!(missing, ["xyz789"]);
    }

    #[test]
    fn missing_video_ids_of_nothing_is_empty() {
        let catalog = testing::catalog();
        let none: [&str; 0] = [];
        assert!(catalog.missing_video_ids(&none).unwrap().is_empty());
    }
}
