//! Relational episode index: consolidation, predicate queries and slicing.

pub mod predicate;
pub mod slice;

use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::{bail, Result};
use datakit_types::index::EpisodeIndexRecord;
use datakit_types::state::Partition;

pub use predicate::{Predicate, PredicateError};
pub use slice::{load_view, slice_dataset, SliceManifest, SliceMode, SliceRequest, SliceView};

use crate::storage::finalize::read_manifest;
use crate::storage::index_file::read_index;
use crate::storage::DatasetLayout;

/// All index records of one partition, in commit order, with a sorted
/// lookup by episode id.
#[derive(Debug, Clone, Default)]
pub struct EpisodeIndex {
    records: Vec<EpisodeIndexRecord>,
    by_id: BTreeMap<String, usize>,
}

impl EpisodeIndex {
    /// Consolidate records given in commit order.
    ///
    /// # Errors
    ///
    /// Fails when two records share an episode id.
    pub fn build(records: Vec<EpisodeIndexRecord>) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for (position, record) in records.iter().enumerate() {
            if by_id.insert(record.episode_id.clone(), position).is_some() {
                bail!("episode '{}' appears twice in the index", record.episode_id);
            }
        }
        Ok(Self { records, by_id })
    }

    /// Load the committed index of `partition` through the shard manifest.
    pub fn load(layout: &DatasetLayout, partition: Partition) -> Result<Self> {
        let manifest = read_manifest(layout)?;
        Self::build(read_index(layout, manifest.partition(partition))?)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in commit order.
    #[must_use]
    pub fn records(&self) -> &[EpisodeIndexRecord] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, episode_id: &str) -> Option<&EpisodeIndexRecord> {
        self.by_id.get(episode_id).map(|&i| &self.records[i])
    }

    /// Records whose id falls in `[start, end)`, in id order.
    pub fn id_range<'a>(
        &'a self,
        start: &'a str,
        end: Option<&'a str>,
    ) -> impl Iterator<Item = &'a EpisodeIndexRecord> + 'a {
        // An inverted range is empty rather than a panic.
        let upper = end.map_or(Bound::Unbounded, |end| Bound::Excluded(end.max(start)));
        self.by_id
            .range::<str, _>((Bound::Included(start), upper))
            .map(|(_, &i)| &self.records[i])
    }

    /// Matching records in commit order.
    #[must_use]
    pub fn query_records(&self, predicate: &Predicate) -> Vec<&EpisodeIndexRecord> {
        if let Some(id) = predicate.pinned_episode_id() {
            return self
                .get(id)
                .filter(|r| predicate.matches(r))
                .into_iter()
                .collect();
        }
        self.records.iter().filter(|r| predicate.matches(r)).collect()
    }

    /// Ids of the matching records, in commit order.
    #[must_use]
    pub fn query(&self, predicate: &Predicate) -> Vec<&str> {
        self.query_records(predicate)
            .into_iter()
            .map(|r| r.episode_id.as_str())
            .collect()
    }

    #[must_use]
    pub fn count(&self, predicate: &Predicate) -> usize {
        self.query_records(predicate).len()
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::index::DataShardRef;

    use super::*;

    fn record(id: &str, num_steps: u64) -> EpisodeIndexRecord {
        EpisodeIndexRecord {
            episode_id: id.to_string(),
            dataset_id: "ds".into(),
            source_episode_index: 0,
            invalid: false,
            num_steps,
            task_id: 0,
            task_text: "t".into(),
            robot_id: String::new(),
            split: "train".into(),
            duration_secs: 0.0,
            camera_set: String::new(),
            action_space_type: "custom".into(),
            source_uri: String::new(),
            data: DataShardRef {
                shard_id: 0,
                row_start: 0,
                row_count: num_steps,
            },
            videos: Vec::new(),
            episode_metadata: BTreeMap::new(),
        }
    }

    fn index() -> EpisodeIndex {
        EpisodeIndex::build(vec![record("c", 10), record("a", 60), record("b", 100)]).unwrap()
    }

    #[test]
    fn test_query_returns_commit_order() {
        let predicate = Predicate::parse("num_steps >= 50").unwrap();
        assert_eq!(index().query(&predicate), vec!["a", "b"]);
        assert_eq!(index().count(&predicate), 2);
        assert_eq!(index().query(&Predicate::all()), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_pinned_lookup() {
        let idx = index();
        assert_eq!(idx.query(&Predicate::parse("episode_id = 'b'").unwrap()), vec!["b"]);
        assert!(idx
            .query(&Predicate::parse("episode_id = 'b' AND num_steps < 5").unwrap())
            .is_empty());
        assert!(idx.query(&Predicate::parse("episode_id = 'zz'").unwrap()).is_empty());
    }

    #[test]
    fn test_id_range_is_sorted() {
        let idx = index();
        let ids: Vec<&str> = idx.id_range("a", Some("c")).map(|r| r.episode_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(idx.id_range("b", None).count(), 2);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        assert!(EpisodeIndex::build(vec![record("a", 1), record("a", 2)]).is_err());
    }
}
