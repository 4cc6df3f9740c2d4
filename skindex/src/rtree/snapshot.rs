//! The read-only tree summary served to queries.
//!
//! A snapshot carries the build parameters, the root node, and the
//! super-node boundaries; everything below the root is read on demand from
//! the node file. It also hosts the subtree candidacy check that lets the
//! nearest-first search skip whole subtrees with no keyword match.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::IndexResult;
use crate::query::{SnInterval, TextPredicate};
use crate::sif::{LeafBitmaps, SpatialInvertedFile};

use super::node::{Node, SuperNodeBoundary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtreeSnapshot {
    capacity: u16,
    min_fill: u16,
    num_field_count: usize,
    root: Node,
    boundaries: HashMap<u32, SuperNodeBoundary>,
}

impl RtreeSnapshot {
    pub fn new(
        capacity: u16,
        min_fill: u16,
        num_field_count: usize,
        root: Node,
        boundaries: HashMap<u32, SuperNodeBoundary>,
    ) -> Self {
        Self {
            capacity,
            min_fill,
            num_field_count,
            root,
            boundaries,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn num_field_count(&self) -> usize {
        self.num_field_count
    }

    pub fn height(&self) -> u16 {
        self.root.level + 1
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn boundaries(&self) -> &HashMap<u32, SuperNodeBoundary> {
        &self.boundaries
    }

    /// The super-node interval covered by the subtree behind an entry.
    /// `level` is the level of the node holding the entry, so the referenced
    /// subtree root sits at `level - 1`.
    fn subtree_sn_interval(&self, entry_id: u64, level: u16) -> SnInterval {
        let m = self.capacity as u64;

        match level {
            0 => {
                let sn = (entry_id / (m * m)) as u32;
                SnInterval::new(sn, sn)
            }
            1 => {
                let sn = (entry_id / m) as u32;
                SnInterval::new(sn, sn)
            }
            2 => SnInterval::new(entry_id as u32, entry_id as u32),
            _ => {
                let mut start = entry_id * m;
                let mut end = entry_id * m + m - 1;
                for _ in 2..=(level as u64 - 2) {
                    start *= m;
                    end = end * m + m - 1;
                }
                SnInterval::new(start as u32, end as u32)
            }
        }
    }

    /// Decides whether the subtree behind an entry can hold a record that
    /// satisfies all text predicates, resolving through the inverted file
    /// only when neither the buffered bitmaps nor the accumulated
    /// non-candidate intervals already answer. A successful resolution
    /// buffers its bitmap and marks the skipped prefix non-candidate, so
    /// sibling checks get cheaper as the search proceeds.
    pub fn is_subtree_candidate(
        &self,
        entry_id: u64,
        level: u16,
        nc_intervals: &mut Vec<SnInterval>,
        buffered: &mut HashMap<u32, LeafBitmaps>,
        predicates: &[TextPredicate],
        sif: &SpatialInvertedFile,
    ) -> IndexResult<bool> {
        let interval = self.subtree_sn_interval(entry_id, level);
        let mut start = interval.start;
        let end = interval.end;

        if level > 2 {
            // Wide intervals can overlap earlier verdicts; narrow or reject.
            for nc in nc_intervals.iter() {
                if start >= nc.start {
                    if end <= nc.end {
                        return Ok(false);
                    } else if start < nc.end {
                        start = nc.end + 1;
                    }
                }
            }
        }

        if !buffered.is_empty() {
            for sn in start..=end {
                if buffered.contains_key(&sn) {
                    return Ok(true);
                }
            }
        }

        match sif.query_supernode_bitmap(SnInterval::new(start, end), predicates)? {
            Some((at_sn, bitmaps)) => {
                buffered.insert(at_sn, bitmaps);
                if at_sn > start {
                    nc_intervals.push(SnInterval::new(start, at_sn - 1));
                }
                Ok(at_sn <= end)
            }
            None => {
                nc_intervals.push(SnInterval::new(start, end));
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ComparisonOperator;
    use crate::rtree::{Point, Rtree};
    use crate::store::BitmapStore;
    use tempfile::tempdir;

    fn snapshot_m(capacity: u16) -> RtreeSnapshot {
        RtreeSnapshot::new(capacity, 1, 0, Node::new(0, 5), HashMap::new())
    }

    #[test]
    fn test_subtree_interval_by_level() {
        let s = snapshot_m(4);

        // Record entries and leaf references collapse to one super node.
        assert_eq!(s.subtree_sn_interval(37, 0), SnInterval::new(2, 2));
        assert_eq!(s.subtree_sn_interval(9, 1), SnInterval::new(2, 2));
        assert_eq!(s.subtree_sn_interval(2, 2), SnInterval::new(2, 2));

        // A level-2 subtree reference spans M super nodes.
        assert_eq!(s.subtree_sn_interval(2, 3), SnInterval::new(8, 11));

        // One level higher spans M² super nodes.
        assert_eq!(s.subtree_sn_interval(1, 4), SnInterval::new(16, 31));
    }

    #[test]
    fn test_nc_interval_containment_and_narrowing() {
        let dir = tempdir().unwrap();
        let store = BitmapStore::open("nc", dir.path()).unwrap();
        let sif = SpatialInvertedFile::new(store, 4, None);
        let s = snapshot_m(4);

        let pred = TextPredicate::new(vec!["lake".into()], ComparisonOperator::Equal, None);

        // Empty store: the whole interval becomes non-candidate.
        let mut nc = Vec::new();
        let mut buffered = HashMap::new();
        let ok = s
            .is_subtree_candidate(2, 3, &mut nc, &mut buffered, &[pred.clone()], &sif)
            .unwrap();
        assert!(!ok);
        assert_eq!(nc, vec![SnInterval::new(8, 11)]);

        // A contained interval is rejected without touching the store.
        let ok = s
            .is_subtree_candidate(2, 3, &mut nc, &mut buffered, &[pred], &sif)
            .unwrap();
        assert!(!ok);
        // No duplicate marking for the contained case.
        assert_eq!(nc.len(), 1);
    }

    #[test]
    fn test_candidate_found_buffers_bitmap() {
        let dir = tempdir().unwrap();
        let store = BitmapStore::open("cand", dir.path()).unwrap();
        let sif = SpatialInvertedFile::new(store, 4, None);
        // "lake" at entry 150: super node 9.
        sif.build_term_bitmaps("lake\t0\t150\n".as_bytes()).unwrap();

        let s = snapshot_m(4);
        let pred = TextPredicate::new(vec!["lake".into()], ComparisonOperator::Equal, None);

        let mut nc = Vec::new();
        let mut buffered = HashMap::new();

        // Level-3 entry 2 covers super nodes 8..=11.
        let ok = s
            .is_subtree_candidate(2, 3, &mut nc, &mut buffered, std::slice::from_ref(&pred), &sif)
            .unwrap();
        assert!(ok);
        assert!(buffered.contains_key(&9));
        // The skipped prefix is marked non-candidate.
        assert_eq!(nc, vec![SnInterval::new(8, 8)]);

        // A sibling touching the buffered super node is answered from the
        // buffer.
        let ok = s
            .is_subtree_candidate(37, 1, &mut nc, &mut buffered, std::slice::from_ref(&pred), &sif)
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_snapshot_roundtrip_through_tree() {
        let mut t = Rtree::new(2, 0.5, 0).unwrap();
        for i in 0..16 {
            t.insert_point(i, Point::new(i as f32, 0.0), None);
        }
        let mut sink = Vec::new();
        t.dump_leaf_entry_ids(&mut sink).unwrap();

        let snap = t.snapshot();
        assert_eq!(snap.capacity(), 2);
        assert_eq!(snap.height(), t.height());
        assert_eq!(snap.boundaries().len(), t.boundaries().len());

        let bytes = bincode::serde::encode_to_vec(&snap, bincode::config::legacy()).unwrap();
        let (back, _): (RtreeSnapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(back.height(), snap.height());
        assert_eq!(back.root(), snap.root());
    }
}
