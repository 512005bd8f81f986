//! Compressed tag → record-id index shared across all tiers.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::RecallOp;

/// Backend storing one set of 32-bit ids per tag.
///
/// Abstracts over a compressed (`roaring`) representation and a plain
/// sorted-set fallback so both can be exercised by the same test suite.
trait TagBitmapBackend: Send + Sync {
    fn insert(&mut self, tag: &str, id: u32);
    fn remove_id(&mut self, tag: &str, id: u32);
    fn contains(&self, tag: &str, id: u32) -> bool;
    fn get(&self, tag: &str) -> Option<Vec<u32>>;
    fn cardinality(&self, tag: &str) -> u64;
    fn tags(&self) -> Vec<String>;
    fn is_empty_tag(&self, tag: &str) -> bool;
    fn drop_tag(&mut self, tag: &str);
}

#[cfg(feature = "roaring-bitmap")]
#[derive(Default)]
struct RoaringBackend {
    by_tag: BTreeMap<String, roaring::RoaringBitmap>,
}

#[cfg(feature = "roaring-bitmap")]
impl TagBitmapBackend for RoaringBackend {
    fn insert(&mut self, tag: &str, id: u32) {
        self.by_tag.entry(tag.to_string()).or_default().insert(id);
    }

    fn remove_id(&mut self, tag: &str, id: u32) {
        if let Some(bm) = self.by_tag.get_mut(tag) {
            bm.remove(id);
        }
    }

    fn contains(&self, tag: &str, id: u32) -> bool {
        self.by_tag.get(tag).is_some_and(|bm| bm.contains(id))
    }

    fn get(&self, tag: &str) -> Option<Vec<u32>> {
        self.by_tag.get(tag).map(|bm| bm.iter().collect())
    }

    fn cardinality(&self, tag: &str) -> u64 {
        self.by_tag.get(tag).map_or(0, roaring::RoaringBitmap::len)
    }

    fn tags(&self) -> Vec<String> {
        self.by_tag.keys().cloned().collect()
    }

    fn is_empty_tag(&self, tag: &str) -> bool {
        self.by_tag.get(tag).is_none_or(roaring::RoaringBitmap::is_empty)
    }

    fn drop_tag(&mut self, tag: &str) {
        self.by_tag.remove(tag);
    }
}

#[derive(Default)]
struct SortedSetBackend {
    by_tag: BTreeMap<String, BTreeSet<u32>>,
}

impl TagBitmapBackend for SortedSetBackend {
    fn insert(&mut self, tag: &str, id: u32) {
        self.by_tag.entry(tag.to_string()).or_default().insert(id);
    }

    fn remove_id(&mut self, tag: &str, id: u32) {
        if let Some(set) = self.by_tag.get_mut(tag) {
            set.remove(&id);
        }
    }

    fn contains(&self, tag: &str, id: u32) -> bool {
        self.by_tag.get(tag).is_some_and(|set| set.contains(&id))
    }

    fn get(&self, tag: &str) -> Option<Vec<u32>> {
        self.by_tag.get(tag).map(|set| set.iter().copied().collect())
    }

    fn cardinality(&self, tag: &str) -> u64 {
        self.by_tag.get(tag).map_or(0, |set| set.len() as u64)
    }

    fn tags(&self) -> Vec<String> {
        self.by_tag.keys().cloned().collect()
    }

    fn is_empty_tag(&self, tag: &str) -> bool {
        self.by_tag.get(tag).is_none_or(BTreeSet::is_empty)
    }

    fn drop_tag(&mut self, tag: &str) {
        self.by_tag.remove(tag);
    }
}

/// Per-tag cardinality and overall totals, as reported by [`TagBitmapIndex::stats`].
#[derive(Debug, Clone, Default)]
pub struct BitmapStats {
    pub per_tag: BTreeMap<String, u64>,
    pub total_tags: usize,
    pub total_memberships: u64,
}

/// Cross-tier compressed index mapping lowercased tag to the set of record
/// ids carrying it.
///
/// Backed by `roaring` when the `roaring-bitmap` feature is enabled (the
/// default), and by a plain sorted-set fallback otherwise. Both
/// implementations honor identical intersection/union/removal semantics.
pub struct TagBitmapIndex {
    backend: Box<dyn TagBitmapBackend>,
    owner: BTreeMap<u32, BTreeSet<String>>,
}

impl TagBitmapIndex {
    /// Builds an index using the compressed backend if available, else the
    /// plain fallback.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(feature = "roaring-bitmap")]
        let backend: Box<dyn TagBitmapBackend> = Box::new(RoaringBackend::default());
        #[cfg(not(feature = "roaring-bitmap"))]
        let backend: Box<dyn TagBitmapBackend> = Box::new(SortedSetBackend::default());

        Self {
            backend,
            owner: BTreeMap::new(),
        }
    }

    /// Forces the plain sorted-set fallback regardless of feature flags.
    /// Used by tests that must exercise both backends side by side.
    #[must_use]
    pub fn new_fallback() -> Self {
        Self {
            backend: Box::new(SortedSetBackend::default()),
            owner: BTreeMap::new(),
        }
    }

    /// Indexes `id` under every tag in `tags` (case-insensitive).
    pub fn add(&mut self, id: u32, tags: &[String]) {
        let mut owned = BTreeSet::new();
        for tag in tags {
            let lower = tag.to_lowercase();
            self.backend.insert(&lower, id);
            owned.insert(lower);
        }
        if !owned.is_empty() {
            self.owner.entry(id).or_default().extend(owned);
        }
    }

    /// Removes `id` from every bitmap it belongs to, pruning tags that
    /// become empty.
    pub fn remove(&mut self, id: u32) {
        let Some(tags) = self.owner.remove(&id) else {
            return;
        };
        for tag in tags {
            self.backend.remove_id(&tag, id);
            if self.backend.is_empty_tag(&tag) {
                self.backend.drop_tag(&tag);
            }
        }
    }

    /// Returns the ids matching `tags` under `op`.
    ///
    /// Empty `tags` always returns empty. For intersection, any tag absent
    /// from the index makes the whole result empty. For union, absent tags
    /// simply contribute nothing.
    #[must_use]
    pub fn query(&self, tags: &[String], op: RecallOp) -> BTreeSet<u32> {
        if tags.is_empty() {
            return BTreeSet::new();
        }
        let lowered: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();

        match op {
            RecallOp::Intersection => {
                let mut sets = Vec::with_capacity(lowered.len());
                for tag in &lowered {
                    match self.backend.get(tag) {
                        Some(ids) if !ids.is_empty() => sets.push(ids.into_iter().collect::<BTreeSet<_>>()),
                        _ => return BTreeSet::new(),
                    }
                }
                let mut iter = sets.into_iter();
                let Some(first) = iter.next() else {
                    return BTreeSet::new();
                };
                iter.fold(first, |acc, s| acc.intersection(&s).copied().collect())
            }
            RecallOp::Union => {
                let mut result = BTreeSet::new();
                for tag in &lowered {
                    if let Some(ids) = self.backend.get(tag) {
                        result.extend(ids);
                    }
                }
                result
            }
        }
    }

    /// Whether `id` is indexed under `tag` (case-insensitive).
    #[must_use]
    pub fn contains(&self, tag: &str, id: u32) -> bool {
        self.backend.contains(&tag.to_lowercase(), id)
    }

    /// Per-tag cardinality and totals.
    #[must_use]
    pub fn stats(&self) -> BitmapStats {
        let mut per_tag = BTreeMap::new();
        let mut total_memberships = 0u64;
        for tag in self.backend.tags() {
            let card = self.backend.cardinality(&tag);
            total_memberships += card;
            per_tag.insert(tag, card);
        }
        BitmapStats {
            total_tags: per_tag.len(),
            total_memberships,
            per_tag,
        }
    }
}

impl Default for TagBitmapIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    fn both_backends() -> Vec<TagBitmapIndex> {
        vec![TagBitmapIndex::new(), TagBitmapIndex::new_fallback()]
    }

    #[test]
    fn membership_matches_stored_tags_on_both_backends() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python", "ai"]));
            assert!(idx.contains("python", 1));
            assert!(idx.contains("AI", 1));
            assert!(!idx.contains("web", 1));
        }
    }

    #[test]
    fn intersection_matches_scenario_3() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python", "ai"]));
            idx.add(2, &tags(&["python", "web"]));
            idx.add(3, &tags(&["ai", "ml"]));
            let result = idx.query(&tags(&["python", "ai"]), RecallOp::Intersection);
            assert_eq!(result, BTreeSet::from([1]));
        }
    }

    #[test]
    fn intersection_with_absent_tag_is_empty() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python"]));
            let result = idx.query(&tags(&["python", "nonexistent"]), RecallOp::Intersection);
            assert!(result.is_empty());
        }
    }

    #[test]
    fn union_skips_absent_tags() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python"]));
            idx.add(2, &tags(&["ai"]));
            let result = idx.query(&tags(&["python", "nonexistent", "ai"]), RecallOp::Union);
            assert_eq!(result, BTreeSet::from([1, 2]));
        }
    }

    #[test]
    fn empty_tag_set_always_empty() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python"]));
            assert!(idx.query(&[], RecallOp::Intersection).is_empty());
            assert!(idx.query(&[], RecallOp::Union).is_empty());
        }
    }

    #[test]
    fn single_tag_intersection_equals_union_equals_plain_query() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["python"]));
            idx.add(2, &tags(&["python"]));
            let inter = idx.query(&tags(&["python"]), RecallOp::Intersection);
            let union = idx.query(&tags(&["python"]), RecallOp::Union);
            assert_eq!(inter, union);
            assert_eq!(inter, BTreeSet::from([1, 2]));
        }
    }

    #[test]
    fn remove_prunes_empty_tags_from_stats() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["solo"]));
            idx.remove(1);
            assert!(!idx.contains("solo", 1));
            assert_eq!(idx.stats().total_tags, 0);
        }
    }

    #[test]
    fn stats_report_cardinality_per_tag() {
        for mut idx in both_backends() {
            idx.add(1, &tags(&["shared"]));
            idx.add(2, &tags(&["shared"]));
            idx.add(3, &tags(&["unique"]));
            let stats = idx.stats();
            assert_eq!(stats.per_tag.get("shared"), Some(&2));
            assert_eq!(stats.per_tag.get("unique"), Some(&1));
            assert_eq!(stats.total_memberships, 3);
        }
    }
}
