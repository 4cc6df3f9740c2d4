//! Bulk-insertion R-tree with per-entry numeric min/max summaries.
//!
//! The tree is built once, single-threaded, via repeated [`Rtree::insert`]
//! calls; after the build the leaf slots are numbered depth-first in base-M
//! so that M² consecutive leaf ids share one level-2 ancestor (a super
//! node), the nodes are drained to an append-only node file, and a compact
//! [`RtreeSnapshot`] carries everything the query side needs.

mod arena;
mod geometry;
mod node;
mod persistence;
mod snapshot;

pub use arena::NodeArena;
pub use geometry::{Point, Rectangle, EARTH_RADIUS, EPSILON};
pub use node::{Node, NodeEntry, NodeRef, NumericRange, SuperNodeBoundary};
pub use persistence::{NodeFileReader, NodeFileWriter, NodeOffsetMap};
pub use snapshot::RtreeSnapshot;

use std::collections::HashMap;
use std::io::Write;

use crate::errors::{IndexError, IndexResult};
use node::quadratic_split;

/// Build-side R-tree. Holds the full working set in an arena until the
/// build completes.
pub struct Rtree {
    arena: NodeArena,
    root: NodeRef,
    capacity: u16,
    min_fill: u16,
    num_field_count: usize,
    boundaries: HashMap<u32, SuperNodeBoundary>,
}

impl Rtree {
    /// Creates an empty tree. `capacity` is the fanout M; `fill_factor` in
    /// (0, 0.5] sets the minimum occupancy after a split.
    pub fn new(capacity: u16, fill_factor: f32, num_field_count: usize) -> IndexResult<Self> {
        if capacity < 2 {
            return Err(IndexError::InvalidArgument(
                "capacity must be greater than 1".into(),
            ));
        }
        if !(fill_factor > 0.0 && fill_factor <= 0.5) {
            return Err(IndexError::InvalidArgument(
                "fill factor must be in (0, 0.5]".into(),
            ));
        }

        let mut arena = NodeArena::new();
        let root = arena.alloc(0);

        Ok(Self {
            arena,
            root,
            capacity,
            min_fill: (capacity as f32 * fill_factor).round() as u16,
            num_field_count,
            boundaries: HashMap::new(),
        })
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn num_field_count(&self) -> usize {
        self.num_field_count
    }

    pub fn height(&self) -> u16 {
        self.arena.get(self.root).level + 1
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn root(&self) -> &Node {
        self.arena.get(self.root)
    }

    pub fn boundaries(&self) -> &HashMap<u32, SuperNodeBoundary> {
        &self.boundaries
    }

    /// Inserts a record reference with a point geometry.
    pub fn insert_point(
        &mut self,
        record_ref: u64,
        point: Point,
        num_range: Option<NumericRange>,
    ) {
        self.insert(record_ref, Rectangle::point(point), num_range);
    }

    /// Inserts a record reference with its bounding rectangle and optional
    /// numeric summary.
    pub fn insert(&mut self, record_ref: u64, rect: Rectangle, num_range: Option<NumericRange>) {
        let leaf = self.choose_leaf(&rect);
        self.insert_into(leaf, record_ref, rect, num_range);
    }

    /// Descends to the leaf whose rectangle needs the least enlargement to
    /// cover `rect`; ties break to the smaller area.
    fn choose_leaf(&self, rect: &Rectangle) -> NodeRef {
        let mut node = self.arena.get(self.root);

        while !node.is_leaf() {
            let mut index = 0;
            let mut min_enlargement = f64::INFINITY;

            for (i, entry) in node.entries.iter().enumerate() {
                let enlarged = entry.rect.min_bounding(rect);
                let enlargement = enlarged.area() - entry.rect.area();

                if enlargement < min_enlargement {
                    min_enlargement = enlargement;
                    index = i;
                } else if enlargement == min_enlargement
                    && entry.rect.area() < node.entries[index].rect.area()
                {
                    index = i;
                }
            }

            node = self.arena.get(node.entries[index].child);
        }

        node.id
    }

    fn insert_into(
        &mut self,
        node_id: NodeRef,
        child: u64,
        rect: Rectangle,
        num_range: Option<NumericRange>,
    ) {
        if self.arena.get(node_id).len() < self.capacity as usize {
            self.arena.get_mut(node_id).push(child, rect, num_range);
            if let Some(parent) = self.arena.get(node_id).parent {
                self.propagate_bounds(parent, node_id, None);
            }
        } else {
            self.split_node(node_id, child, rect, num_range);
        }
    }

    fn split_node(
        &mut self,
        node_id: NodeRef,
        child: u64,
        rect: Rectangle,
        num_range: Option<NumericRange>,
    ) {
        let (level, parent) = {
            let node = self.arena.get(node_id);
            (node.level, node.parent)
        };

        let mut entries = std::mem::take(&mut self.arena.get_mut(node_id).entries);
        entries.push(NodeEntry {
            child,
            rect,
            num_range,
        });
        let (group1, group2) = quadratic_split(entries, self.min_fill as usize);

        // The first group reuses the split node's id, so references from the
        // parent stay valid.
        self.arena.get_mut(node_id).entries = group1;
        let sibling = self.arena.alloc(level);
        self.arena.get_mut(sibling).entries = group2;

        if level > 0 {
            let moved: Vec<NodeRef> = self
                .arena
                .get(sibling)
                .entries
                .iter()
                .map(|e| e.child)
                .collect();
            for id in moved {
                self.arena.get_mut(id).parent = Some(sibling);
            }
        }

        match parent {
            None => {
                // Root split: the tree grows by one level.
                let new_root = self.arena.alloc(level + 1);
                for id in [node_id, sibling] {
                    let (mbr, range) = self.summarize(id);
                    self.arena.get_mut(new_root).push(id, mbr, range);
                    self.arena.get_mut(id).parent = Some(new_root);
                }
                self.root = new_root;
            }
            Some(parent_id) => {
                self.arena.get_mut(sibling).parent = Some(parent_id);
                self.propagate_bounds(parent_id, node_id, Some(sibling));
            }
        }
    }

    /// Recomputes the parent entry for `child_id` and carries the adjustment
    /// up the tree; a freshly split sibling is inserted into the parent,
    /// which may cascade further splits.
    fn propagate_bounds(
        &mut self,
        node_id: NodeRef,
        child_id: NodeRef,
        new_sibling: Option<NodeRef>,
    ) {
        let (mbr, range) = self.summarize(child_id);

        let node = self.arena.get_mut(node_id);
        for entry in node.entries.iter_mut() {
            if entry.child == child_id {
                entry.rect = mbr;
                entry.num_range = range;
                break;
            }
        }

        if let Some(sibling) = new_sibling {
            let (sib_mbr, sib_range) = self.summarize(sibling);
            self.insert_into(node_id, sibling, sib_mbr, sib_range);
        } else if let Some(parent) = self.arena.get(node_id).parent {
            self.propagate_bounds(parent, node_id, None);
        }
    }

    fn summarize(&self, node_id: NodeRef) -> (Rectangle, Option<NumericRange>) {
        let node = self.arena.get(node_id);
        (
            node.min_bounding_rect(),
            node.aggregate_numeric_range(self.num_field_count),
        )
    }

    /// Depth-first traversal assigning each leaf slot a dense base-M entry
    /// id, writing `record_ref \t entry_id` rows. Super-node boundaries
    /// (per-leaf occupancy) are recorded when the tree is tall enough to
    /// have level-2 ancestors.
    pub fn dump_leaf_entry_ids(&mut self, out: &mut impl Write) -> IndexResult<()> {
        self.boundaries.clear();
        let record_boundaries = self.arena.get(self.root).level > 2;

        let root_children: Vec<NodeRef> = self
            .arena
            .get(self.root)
            .entries
            .iter()
            .map(|e| e.child)
            .collect();

        if self.arena.get(self.root).is_leaf() {
            // Trivial tree: the root itself holds the records.
            for (i, entry) in self.arena.get(self.root).entries.iter().enumerate() {
                writeln!(out, "{}\t{}", entry.child, i)?;
            }
            return Ok(());
        }

        for (i, child) in root_children.into_iter().enumerate() {
            dump_node(
                &self.arena,
                self.capacity as u64,
                record_boundaries,
                &mut self.boundaries,
                child,
                i as u64,
                out,
            )?;
        }

        Ok(())
    }

    /// Extracts the read-only view served to queries.
    pub fn snapshot(&self) -> RtreeSnapshot {
        RtreeSnapshot::new(
            self.capacity,
            self.min_fill,
            self.num_field_count,
            self.arena.get(self.root).clone(),
            self.boundaries.clone(),
        )
    }

    /// Releases the in-memory working set once all nodes are persisted.
    pub fn release_working_set(&mut self) {
        self.arena.clear();
    }
}

/// `node_entry_id` is the node's own entry id in the global base-M
/// numbering; its children occupy ids `node_entry_id * M ..`.
fn dump_node(
    arena: &NodeArena,
    capacity: u64,
    record_boundaries: bool,
    boundaries: &mut HashMap<u32, SuperNodeBoundary>,
    node_id: NodeRef,
    node_entry_id: u64,
    out: &mut impl Write,
) -> IndexResult<()> {
    let node = arena.get(node_id);
    let start_entry_id = node_entry_id * capacity;

    if node.is_leaf() {
        for (i, entry) in node.entries.iter().enumerate() {
            writeln!(out, "{}\t{}", entry.child, start_entry_id + i as u64)?;
        }
        return Ok(());
    }

    let mut boundary = if node.level == 1 && record_boundaries {
        Some(SuperNodeBoundary::new(node.len()))
    } else {
        None
    };

    for (i, entry) in node.entries.iter().enumerate() {
        dump_node(
            arena,
            capacity,
            record_boundaries,
            boundaries,
            entry.child,
            start_entry_id + i as u64,
            out,
        )?;

        if let Some(b) = boundary.as_mut() {
            b.set(i, arena.get(entry.child).len() as u16);
        }
    }

    if let Some(b) = boundary {
        // A level-1 node's entry id equals the super-node id of every record
        // slot beneath it.
        boundaries.insert(node_entry_id as u32, b);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(capacity: u16) -> Rtree {
        Rtree::new(capacity, 0.5, 0).unwrap()
    }

    /// Checks occupancy and exact-MBR invariants on every node.
    fn assert_invariants(t: &Rtree) {
        let root = t.root();
        check_node(t, root);
    }

    fn check_node(t: &Rtree, node: &Node) {
        if !node.is_root() {
            assert!(node.len() >= t.min_fill as usize, "underfilled node");
        }
        assert!(node.len() <= t.capacity as usize, "overfilled node");

        if node.is_leaf() {
            return;
        }

        for entry in &node.entries {
            let child = t.arena.get(entry.child);
            assert_eq!(child.level + 1, node.level);
            assert_eq!(child.parent, Some(node.id));
            assert_eq!(entry.rect, child.min_bounding_rect(), "stale parent MBR");
            check_node(t, child);
        }
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(Rtree::new(1, 0.4, 0).is_err());
        assert!(Rtree::new(8, 0.6, 0).is_err());
        assert!(Rtree::new(8, -0.1, 0).is_err());
        // Zero would allow degenerate single-entry splits.
        assert!(Rtree::new(8, 0.0, 0).is_err());
        assert!(Rtree::new(2, 0.5, 0).is_ok());
    }

    #[test]
    fn test_capacity_plus_one_forces_single_split() {
        let mut t = tree(4);
        for i in 0..5 {
            t.insert_point(i, Point::new(i as f32, 0.0), None);
        }

        let root = t.root();
        assert_eq!(root.level, 1);
        assert_eq!(root.len(), 2);
        assert_eq!(t.height(), 2);

        let total: usize = root
            .entries
            .iter()
            .map(|e| t.arena.get(e.child).len())
            .sum();
        assert_eq!(total, 5);
        assert_invariants(&t);
    }

    #[test]
    fn test_height_grows_only_on_root_split() {
        let mut t = tree(3);
        let mut last_height = t.height();
        for i in 0..40 {
            t.insert_point(i, Point::new((i % 7) as f32, (i / 7) as f32), None);
            let h = t.height();
            assert!(h == last_height || h == last_height + 1);
            last_height = h;
        }
        assert!(last_height >= 3);
        assert_invariants(&t);
    }

    #[test]
    fn test_bulk_insert_invariants() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let mut t = tree(8);
        for i in 0..500 {
            let x = rng.gen_range(-180.0f32..180.0);
            let y = rng.gen_range(-90.0f32..90.0);
            t.insert_point(i, Point::new(x, y), None);
        }

        assert_invariants(&t);
    }

    #[test]
    fn test_numeric_ranges_propagate_to_root() {
        let mut t = Rtree::new(3, 0.4, 1).unwrap();
        for i in 0..20 {
            t.insert_point(
                i,
                Point::new(i as f32, i as f32),
                Some(NumericRange::from_values(vec![i as f32])),
            );
        }

        let root = t.root();
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for entry in &root.entries {
            let r = entry.num_range.as_ref().expect("range on root entry");
            lo = lo.min(r.lower_bound_at(0));
            hi = hi.max(r.upper_bound_at(0));
        }
        assert_eq!(lo, 0.0);
        assert_eq!(hi, 19.0);
    }

    #[test]
    fn test_dump_leaf_entry_ids_groups_by_ancestor() {
        let mut t = tree(2);
        for i in 0..16 {
            t.insert_point(100 + i, Point::new(i as f32, 0.0), None);
        }
        assert!(t.height() >= 4, "need level-2 ancestors for this test");

        let mut buf = Vec::new();
        t.dump_leaf_entry_ids(&mut buf).unwrap();

        let rows: Vec<(u64, u64)> = String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| {
                let (r, e) = l.split_once('\t').unwrap();
                (r.parse().unwrap(), e.parse().unwrap())
            })
            .collect();

        assert_eq!(rows.len(), 16);

        // Every record appears exactly once, ids are unique.
        let mut refs: Vec<u64> = rows.iter().map(|&(r, _)| r).collect();
        refs.sort_unstable();
        refs.dedup();
        assert_eq!(refs.len(), 16);

        let mut ids: Vec<u64> = rows.iter().map(|&(_, e)| e).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        // Boundaries were recorded and describe real occupancies.
        assert!(!t.boundaries().is_empty());
        for boundary in t.boundaries().values() {
            for i in 0..boundary.len() {
                assert!(boundary.get(i) as usize <= t.capacity() as usize);
            }
        }

        // Entry id arithmetic: a record's super node is entry_id / M².
        let m = t.capacity() as u64;
        for &(_, entry_id) in &rows {
            let sn = (entry_id / (m * m)) as u32;
            assert!(
                t.boundaries().contains_key(&sn),
                "super node {sn} missing a boundary"
            );
        }
    }

    #[test]
    fn test_dump_trivial_tree() {
        let mut t = tree(8);
        for i in 0..3 {
            t.insert_point(i, Point::new(i as f32, 0.0), None);
        }

        let mut buf = Vec::new();
        t.dump_leaf_entry_ids(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(t.boundaries().is_empty());
    }
}
