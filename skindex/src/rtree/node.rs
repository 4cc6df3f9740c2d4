//! R-tree pages: entries, numeric summaries, and the quadratic split.

use serde::{Deserialize, Serialize};

use super::geometry::Rectangle;

/// Identifier of a persisted node page.
pub type NodeRef = u64;

// ============================================================================
// NumericRange
// ============================================================================

/// Per-field numeric min/max summary attached to an entry.
///
/// Leaf entries carry only `lower` (the record's field values); inner entries
/// carry both bounds aggregated over their subtree. Absence of numeric fields
/// is `Option<NumericRange>::None` on the entry, never an empty vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    lower: Vec<f32>,
    upper: Option<Vec<f32>>,
}

impl NumericRange {
    /// A leaf-level range: the record's values themselves.
    pub fn from_values(values: Vec<f32>) -> Self {
        Self {
            lower: values,
            upper: None,
        }
    }

    pub fn field_count(&self) -> usize {
        self.lower.len()
    }

    pub fn lower_bound_at(&self, index: usize) -> f32 {
        self.lower.get(index).copied().unwrap_or(f32::NAN)
    }

    /// Upper bound for one field; for leaf-level ranges this is the value
    /// itself.
    pub fn upper_bound_at(&self, index: usize) -> f32 {
        match &self.upper {
            Some(upper) => upper.get(index).copied().unwrap_or(f32::NAN),
            None => self.lower_bound_at(index),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// One entry of a node: a child reference (inner node page id, or record
/// byte offset for leaves), its bounding rectangle, and an optional numeric
/// summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub child: u64,
    pub rect: Rectangle,
    pub num_range: Option<NumericRange>,
}

/// An R-tree page. Level 0 is the leaf level; non-root nodes hold between
/// `min_fill` and `capacity` entries, the root may be sub-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeRef,
    pub parent: Option<NodeRef>,
    pub level: u16,
    pub entries: Vec<NodeEntry>,
}

impl Node {
    pub fn new(id: NodeRef, level: u16) -> Self {
        Self {
            id,
            parent: None,
            level,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, child: u64, rect: Rectangle, num_range: Option<NumericRange>) {
        self.entries.push(NodeEntry {
            child,
            rect,
            num_range,
        });
    }

    /// Exact minimum bounding rectangle of all entries. Panics on an empty
    /// node, which cannot occur outside of construction.
    pub fn min_bounding_rect(&self) -> Rectangle {
        let mut rect = self.entries[0].rect;
        for entry in &self.entries[1..] {
            rect = rect.min_bounding(&entry.rect);
        }
        rect
    }

    /// Aggregated numeric min/max over all entries, with both bounds
    /// materialized (the result is always stored in a parent entry).
    pub fn aggregate_numeric_range(&self, num_field_count: usize) -> Option<NumericRange> {
        if num_field_count == 0 {
            return None;
        }
        self.entries.first()?.num_range.as_ref()?;

        let mut lower = vec![f32::INFINITY; num_field_count];
        let mut upper = vec![f32::NEG_INFINITY; num_field_count];

        for range in self.entries.iter().filter_map(|e| e.num_range.as_ref()) {
            for j in 0..num_field_count {
                lower[j] = lower[j].min(range.lower_bound_at(j));
                upper[j] = upper[j].max(range.upper_bound_at(j));
            }
        }

        Some(NumericRange {
            lower,
            upper: Some(upper),
        })
    }
}

// ============================================================================
// Quadratic split
// ============================================================================

/// Splits an overflowing entry set (capacity + 1 entries) into two groups.
///
/// Seeds are the pair whose combined rectangle wastes the most area. Each
/// remaining entry is assigned, most-contentious first (largest difference
/// between its two enlargements), to the group it enlarges least; ties fall
/// to the smaller-area group, then the smaller group, then group one. When a
/// group would otherwise end under `min_fill`, the remainder is forced into
/// it.
pub fn quadratic_split(entries: Vec<NodeEntry>, min_fill: usize) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    let n = entries.len();
    debug_assert!(n >= 2);

    let (seed1, seed2) = pick_seeds(&entries);

    let mut group1: Vec<usize> = vec![seed1];
    let mut group2: Vec<usize> = vec![seed2];
    let mut assigned = vec![false; n];
    assigned[seed1] = true;
    assigned[seed2] = true;
    let mut unassigned = n - 2;

    while unassigned > 0 {
        // Legality: force the remainder into a group that would otherwise
        // fall below minimum fill.
        if min_fill.saturating_sub(group1.len()) == unassigned {
            for (i, done) in assigned.iter().enumerate() {
                if !done {
                    group1.push(i);
                }
            }
            break;
        }
        if min_fill.saturating_sub(group2.len()) == unassigned {
            for (i, done) in assigned.iter().enumerate() {
                if !done {
                    group2.push(i);
                }
            }
            break;
        }

        let rect1 = cover(&entries, &group1);
        let rect2 = cover(&entries, &group2);

        let mut cost = -1.0f64;
        let mut pick = 0usize;
        let mut pick_enl1 = 0.0f64;
        let mut pick_enl2 = 0.0f64;

        for (i, done) in assigned.iter().enumerate() {
            if *done {
                continue;
            }
            let enl1 = rect1.min_bounding(&entries[i].rect).area() - rect1.area();
            let enl2 = rect2.min_bounding(&entries[i].rect).area() - rect2.area();
            let diff = (enl1 - enl2).abs();

            if diff > cost {
                cost = diff;
                pick = i;
                pick_enl1 = enl1;
                pick_enl2 = enl2;
            }
        }

        if pick_enl1 < pick_enl2 {
            group1.push(pick);
        } else if pick_enl2 < pick_enl1 {
            group2.push(pick);
        } else if rect1.area() < rect2.area() {
            group1.push(pick);
        } else if rect2.area() < rect1.area() {
            group2.push(pick);
        } else if group1.len() < group2.len() {
            group1.push(pick);
        } else if group2.len() < group1.len() {
            group2.push(pick);
        } else {
            group1.push(pick);
        }

        assigned[pick] = true;
        unassigned -= 1;
    }

    let mut taken: Vec<Option<NodeEntry>> = entries.into_iter().map(Some).collect();
    let collect = |idxs: &[usize], taken: &mut Vec<Option<NodeEntry>>| {
        idxs.iter()
            .map(|&i| taken[i].take().expect("entry assigned once"))
            .collect::<Vec<_>>()
    };

    let out1 = collect(&group1, &mut taken);
    let out2 = collect(&group2, &mut taken);
    (out1, out2)
}

/// The pair of entries whose combined rectangle has the largest wasted area.
fn pick_seeds(entries: &[NodeEntry]) -> (usize, usize) {
    let mut worst = f64::NEG_INFINITY;
    let mut seeds = (0, 0);

    for i in 0..entries.len() - 1 {
        for j in i + 1..entries.len() {
            let combined = entries[i].rect.min_bounding(&entries[j].rect);
            let waste = combined.area() - entries[i].rect.area() - entries[j].rect.area();
            if waste > worst {
                worst = waste;
                seeds = (i, j);
            }
        }
    }

    seeds
}

fn cover(entries: &[NodeEntry], group: &[usize]) -> Rectangle {
    let mut rect = entries[group[0]].rect;
    for &i in &group[1..] {
        rect = rect.min_bounding(&entries[i].rect);
    }
    rect
}

// ============================================================================
// SuperNodeBoundary
// ============================================================================

/// True occupancy of each leaf node grouped under one super node.
///
/// Leaf nodes need not be full, so bitmap bit positions past a leaf's real
/// size must be masked off before NOT semantics can trust a set bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperNodeBoundary {
    sizes: Vec<u16>,
}

impl SuperNodeBoundary {
    pub fn new(node_count: usize) -> Self {
        Self {
            sizes: vec![0; node_count],
        }
    }

    pub fn set(&mut self, index: usize, size: u16) {
        if index < self.sizes.len() {
            self.sizes[index] = size;
        }
    }

    /// Occupancy of the leaf at `index`, or zero past the recorded span.
    pub fn get(&self, index: usize) -> u16 {
        self.sizes.get(index).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::geometry::Point;

    fn point_entry(x: f32, y: f32) -> NodeEntry {
        NodeEntry {
            child: 0,
            rect: Rectangle::point(Point::new(x, y)),
            num_range: None,
        }
    }

    #[test]
    fn test_split_preserves_all_entries() {
        let entries: Vec<NodeEntry> = (0..9).map(|i| point_entry(i as f32, 0.0)).collect();
        let (g1, g2) = quadratic_split(entries, 4);
        assert_eq!(g1.len() + g2.len(), 9);
        assert!(g1.len() >= 4);
        assert!(g2.len() >= 4);
    }

    #[test]
    fn test_split_separates_clusters() {
        // Two tight clusters far apart must not be mixed. The diagonal
        // offsets keep pair rectangles non-degenerate; collinear points all
        // have zero waste and seed selection becomes arbitrary.
        let mut entries = Vec::new();
        for i in 0..3 {
            entries.push(point_entry(i as f32 * 0.01, i as f32 * 0.01));
        }
        for i in 0..3 {
            entries.push(point_entry(100.0 + i as f32 * 0.01, 50.0 + i as f32 * 0.01));
        }

        let (g1, g2) = quadratic_split(entries, 2);
        for group in [&g1, &g2] {
            let xs: Vec<f32> = group.iter().map(|e| e.rect.southwest().x).collect();
            let all_low = xs.iter().all(|&x| x < 50.0);
            let all_high = xs.iter().all(|&x| x >= 50.0);
            assert!(all_low || all_high, "cluster split across groups: {xs:?}");
        }
    }

    #[test]
    fn test_split_min_fill_forced() {
        // Collinear points with one distant outlier: legality check must
        // still leave both groups at min_fill.
        let mut entries: Vec<NodeEntry> = (0..5).map(|i| point_entry(i as f32, 0.0)).collect();
        entries.push(point_entry(1000.0, 0.0));

        let (g1, g2) = quadratic_split(entries, 3);
        assert_eq!(g1.len() + g2.len(), 6);
        assert!(g1.len() >= 3);
        assert!(g2.len() >= 3);
    }

    #[test]
    fn test_aggregate_numeric_range() {
        let mut node = Node::new(0, 0);
        node.push(
            1,
            Rectangle::point(Point::new(0.0, 0.0)),
            Some(NumericRange::from_values(vec![3.0, 10.0])),
        );
        node.push(
            2,
            Rectangle::point(Point::new(1.0, 1.0)),
            Some(NumericRange::from_values(vec![1.0, 20.0])),
        );

        let agg = node.aggregate_numeric_range(2).unwrap();
        assert_eq!(agg.lower_bound_at(0), 1.0);
        assert_eq!(agg.upper_bound_at(0), 3.0);
        assert_eq!(agg.lower_bound_at(1), 10.0);
        assert_eq!(agg.upper_bound_at(1), 20.0);
    }

    #[test]
    fn test_aggregate_numeric_range_absent() {
        let mut node = Node::new(0, 0);
        node.push(1, Rectangle::point(Point::new(0.0, 0.0)), None);
        assert!(node.aggregate_numeric_range(0).is_none());
        assert!(node.aggregate_numeric_range(2).is_none());
    }

    #[test]
    fn test_leaf_range_upper_falls_back_to_lower() {
        let r = NumericRange::from_values(vec![7.5]);
        assert_eq!(r.lower_bound_at(0), 7.5);
        assert_eq!(r.upper_bound_at(0), 7.5);
        assert!(r.lower_bound_at(3).is_nan());
    }

    #[test]
    fn test_super_node_boundary() {
        let mut b = SuperNodeBoundary::new(3);
        b.set(0, 80);
        b.set(2, 41);
        assert_eq!(b.get(0), 80);
        assert_eq!(b.get(1), 0);
        assert_eq!(b.get(2), 41);
        assert_eq!(b.get(7), 0);
        assert_eq!(b.len(), 3);
    }
}
