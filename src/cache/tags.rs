//! Invalidation Index (surrogate keys)
//!
//! Maps a tag to the set of keys currently carrying it, so a whole group of
//! unrelated entries can be dropped in O(|affected|) instead of scanning the
//! cache.
//!
//! The index is derived state. The entry store updates it while holding the
//! key's shard lock, which keeps "key in tag set ⇔ entry carries tag" true
//! per key. It is never a source of liveness: resolved keys may have expired
//! since they were tagged and must be re-checked against the entry store.

use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;

use super::entry::CacheKey;

/// Tag → key set
#[derive(Debug, Default)]
pub struct TagIndex {
    tags: DashMap<String, HashSet<CacheKey>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with every tag (idempotent)
    pub fn tag<'a, I>(&self, key: &CacheKey, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Remove the association between `key` and every tag
    pub fn untag<'a, I>(&self, key: &CacheKey, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            // Drop the set entirely once its last key is gone
            self.tags.remove_if_mut(tag, |_, keys| {
                keys.remove(key);
                keys.is_empty()
            });
        }
    }

    /// Move `key` from its old tag set to its new one, touching only the difference
    pub fn retag(&self, key: &CacheKey, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        self.untag(key, old.difference(new));
        self.tag(key, new.difference(old));
    }

    /// Candidate keys for `tag`; callers must re-validate liveness
    pub fn resolve(&self, tag: &str) -> HashSet<CacheKey> {
        self.tags
            .get(tag)
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    /// Remove and return the whole key set for `tag`
    pub fn take(&self, tag: &str) -> HashSet<CacheKey> {
        self.tags
            .remove(tag)
            .map(|(_, keys)| keys)
            .unwrap_or_default()
    }

    /// Whether `key` is in `tag`'s set
    pub fn contains(&self, tag: &str, key: &CacheKey) -> bool {
        self.tags
            .get(tag)
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    /// Number of distinct tags
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn clear(&self) {
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tag_and_resolve() {
        let index = TagIndex::new();
        let x = CacheKey::new("x");
        let y = CacheKey::new("y");

        index.tag(&x, &tags(&["team1", "team2"]));
        index.tag(&y, &tags(&["team1"]));
        // Idempotent
        index.tag(&y, &tags(&["team1"]));

        let team1 = index.resolve("team1");
        assert_eq!(team1.len(), 2);
        assert!(team1.contains(&x) && team1.contains(&y));
        assert_eq!(index.resolve("team2").len(), 1);
        assert!(index.resolve("unknown").is_empty());
    }

    #[test]
    fn test_untag_drops_empty_sets() {
        let index = TagIndex::new();
        let x = CacheKey::new("x");

        index.tag(&x, &tags(&["a", "b"]));
        assert_eq!(index.tag_count(), 2);

        index.untag(&x, &tags(&["a"]));
        assert_eq!(index.tag_count(), 1);
        assert!(!index.contains("a", &x));
        assert!(index.contains("b", &x));
    }

    #[test]
    fn test_retag_applies_difference() {
        let index = TagIndex::new();
        let x = CacheKey::new("x");

        index.tag(&x, &tags(&["old", "kept"]));
        index.retag(&x, &tags(&["old", "kept"]), &tags(&["kept", "new"]));

        assert!(!index.contains("old", &x));
        assert!(index.contains("kept", &x));
        assert!(index.contains("new", &x));
    }

    #[test]
    fn test_take_removes_tag() {
        let index = TagIndex::new();
        let x = CacheKey::new("x");
        index.tag(&x, &tags(&["t"]));

        let taken = index.take("t");
        assert_eq!(taken.len(), 1);
        assert!(index.resolve("t").is_empty());
        assert!(index.take("t").is_empty());
    }
}
