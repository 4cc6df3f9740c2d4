//! Best-first k-NN search over one or several spatial keyword indexes.
//!
//! A min-heap ordered by distance holds both record references and inner
//! node references. Popping a record yields it; popping an inner node first
//! runs the lazy filter (super-node candidacy via the inverted file), then
//! reads the node and enqueues its surviving children. With several members
//! each one keeps its own node file handle, dataset reader and bitmap
//! bookkeeping, so federated search is the same loop with a member tag on
//! every heap entry.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dataset::{RandomDatasetReader, Record};
use crate::errors::IndexResult;
use crate::rtree::{Node, NodeFileReader, NodeRef, NumericRange, Point, RtreeSnapshot};
use crate::sif::{LeafBitmaps, SpatialInvertedFile};

use super::predicate::{NumericPredicate, TextPredicate};
use super::SnInterval;

/// Queries exceeding this wall-clock budget, measured from iterator
/// construction, are cut off; debug mode lifts the limit.
const MAX_SEARCH_TIME: Duration = Duration::from_millis(5000);

/// One k-NN Boolean query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub point: Point,
    pub radius: f64,
    pub top_k: usize,
    pub numeric_predicates: Vec<NumericPredicate>,
    pub text_predicates: Vec<TextPredicate>,
    pub debug_mode: bool,
}

impl QuerySpec {
    pub fn nearest(point: Point, radius: f64, top_k: usize) -> Self {
        Self {
            point,
            radius,
            top_k,
            numeric_predicates: Vec::new(),
            text_predicates: Vec::new(),
            debug_mode: false,
        }
    }
}

/// A result record with its distance to the query point and the member
/// index it came from (0 for a single index).
#[derive(Debug)]
pub struct ScoredRecord {
    pub record: Record,
    pub distance: f64,
    pub member: usize,
}

// ============================================================================
// Heap entries
// ============================================================================

#[derive(Debug, Clone)]
struct SearchEntry {
    /// Node page id for inner references, record byte offset otherwise.
    child: u64,
    distance: f64,
    points_to_inner: bool,
    /// Level of the referenced node (meaningless for records).
    node_level: u16,
    /// The referenced node's own entry id in the global base-M numbering;
    /// for records, the record's leaf-slot entry id.
    entry_id: u64,
    member: usize,
}

impl PartialEq for SearchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for SearchEntry {}

impl PartialOrd for SearchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchEntry {
    // Reversed so the binary heap pops the smallest distance first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.distance.total_cmp(&self.distance)
    }
}

// ============================================================================
// Query members
// ============================================================================

/// Per-index query state: shared read-only structures plus this query's own
/// file handles and bitmap bookkeeping.
pub(crate) struct QueryMember {
    snapshot: Arc<RtreeSnapshot>,
    sif: Arc<SpatialInvertedFile>,
    preloaded: Arc<HashMap<NodeRef, Node>>,
    node_reader: NodeFileReader,
    dataset_reader: RandomDatasetReader,
    node_io_reads: Arc<AtomicU64>,
    buffered_bitmaps: HashMap<u32, LeafBitmaps>,
    nc_intervals: Vec<SnInterval>,
}

impl QueryMember {
    pub(crate) fn new(
        snapshot: Arc<RtreeSnapshot>,
        sif: Arc<SpatialInvertedFile>,
        preloaded: Arc<HashMap<NodeRef, Node>>,
        node_reader: NodeFileReader,
        dataset_reader: RandomDatasetReader,
        node_io_reads: Arc<AtomicU64>,
    ) -> Self {
        Self {
            snapshot,
            sif,
            preloaded,
            node_reader,
            dataset_reader,
            node_io_reads,
            buffered_bitmaps: HashMap::new(),
            nc_intervals: Vec::new(),
        }
    }

    fn read_node(&mut self, id: NodeRef) -> IndexResult<Node> {
        if let Some(node) = self.preloaded.get(&id) {
            return Ok(node.clone());
        }
        let node = self.node_reader.read_node(id)?;
        self.node_io_reads.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(node)
    }
}

// ============================================================================
// ResultIterator
// ============================================================================

pub struct ResultIterator {
    query_point: Point,
    distance_limit: f64,
    top_k: usize,
    yielded: usize,
    numeric_predicates: Vec<NumericPredicate>,
    text_predicates: Vec<TextPredicate>,
    members: Vec<QueryMember>,
    queue: BinaryHeap<SearchEntry>,
    debug_mode: bool,
    started: Instant,
    done: bool,
}

impl ResultIterator {
    /// Search over a single index: seed the heap with the root's children.
    /// Trees shorter than three levels need an up-front candidacy check
    /// because their root children already sit at bitmap granularity.
    pub(crate) fn single(member: QueryMember, query: &QuerySpec) -> IndexResult<Self> {
        let mut it = Self::empty(vec![member], query);

        let root = it.members[0].snapshot.root().clone();
        let mut bitmap: Option<LeafBitmaps> = None;

        if root.level < 2 && !it.text_predicates.is_empty() {
            let m = &mut it.members[0];
            let candidate = m.snapshot.is_subtree_candidate(
                0,
                root.level + 1,
                &mut m.nc_intervals,
                &mut m.buffered_bitmaps,
                &it.text_predicates,
                &m.sif,
            )?;
            if !candidate {
                it.done = true;
                return Ok(it);
            }
            bitmap = it.query_bitmap(0, root.level, 0);
        }

        it.enqueue_entries(0, &root, bitmap.as_ref(), 0);
        Ok(it)
    }

    /// Federated search: seed the heap with one entry per member root,
    /// filtered by radius and numeric range like any other node entry.
    pub(crate) fn federated(
        members: Vec<QueryMember>,
        merged_root: &Node,
        query: &QuerySpec,
    ) -> IndexResult<Self> {
        let mut it = Self::empty(members, query);

        for (i, entry) in merged_root.entries.iter().enumerate() {
            let distance = entry.rect.distance(&it.query_point);
            if distance > it.distance_limit {
                continue;
            }
            if let Some(range) = &entry.num_range {
                if !it.range_satisfies_predicates(range) {
                    continue;
                }
            }

            it.queue.push(SearchEntry {
                child: entry.child,
                distance,
                points_to_inner: true,
                node_level: it.members[i].snapshot.root().level,
                entry_id: 0,
                member: i,
            });
        }

        Ok(it)
    }

    fn empty(members: Vec<QueryMember>, query: &QuerySpec) -> Self {
        Self {
            query_point: query.point,
            distance_limit: query.radius,
            top_k: query.top_k,
            yielded: 0,
            numeric_predicates: query.numeric_predicates.clone(),
            text_predicates: query.text_predicates.clone(),
            members,
            queue: BinaryHeap::new(),
            debug_mode: query.debug_mode,
            started: Instant::now(),
            done: false,
        }
    }

    /// Releases file handles; the iterator yields nothing afterwards.
    pub fn close(&mut self) {
        self.queue.clear();
        self.members.clear();
        self.done = true;
    }

    fn range_satisfies_predicates(&self, range: &NumericRange) -> bool {
        self.numeric_predicates
            .iter()
            .all(|p| p.is_satisfied_by_range(range))
    }

    /// Exact numeric check on a materialized record. Range pruning is only
    /// a necessary condition; `NotEqual` in particular passes every range
    /// and must be enforced against the record's own field values.
    fn record_satisfies_predicates(&self, record: &Record) -> bool {
        if self.numeric_predicates.is_empty() {
            return true;
        }
        let Some(values) = record.numeric_values() else {
            return true;
        };
        self.numeric_predicates.iter().all(|p| {
            values
                .get(p.field_index)
                .map_or(true, |&v| p.is_satisfied_by(v))
        })
    }

    /// Pops heap entries until the next record surfaces. Inner nodes go
    /// through the lazy filter before their children are enqueued.
    fn advance(&mut self) -> IndexResult<Option<SearchEntry>> {
        let has_text = !self.text_predicates.is_empty();

        while let Some(entry) = self.queue.pop() {
            if !self.debug_mode && self.started.elapsed() > MAX_SEARCH_TIME {
                log::warn!("search cut off after {:?}", MAX_SEARCH_TIME);
                return Ok(None);
            }

            if !entry.points_to_inner {
                return Ok(Some(entry));
            }

            let (node, bitmap) = {
                let m = &mut self.members[entry.member];

                if has_text {
                    let candidate = m.snapshot.is_subtree_candidate(
                        entry.entry_id,
                        entry.node_level + 1,
                        &mut m.nc_intervals,
                        &mut m.buffered_bitmaps,
                        &self.text_predicates,
                        &m.sif,
                    )?;
                    if !candidate {
                        continue;
                    }
                }

                let node = m.read_node(entry.child)?;
                let bitmap = has_text
                    .then(|| self.query_bitmap(entry.member, entry.node_level, entry.entry_id))
                    .flatten();
                (node, bitmap)
            };

            let capacity = self.members[entry.member].snapshot.capacity() as u64;
            self.enqueue_entries(
                entry.member,
                &node,
                bitmap.as_ref(),
                entry.entry_id * capacity,
            );
        }

        Ok(None)
    }

    /// The buffered per-leaf bitmaps relevant to a node reference: the whole
    /// super node for a level-1 node, the node's single slice for a leaf.
    fn query_bitmap(&self, member: usize, node_level: u16, entry_id: u64) -> Option<LeafBitmaps> {
        let m = &self.members[member];
        let capacity = m.snapshot.capacity() as u64;

        match node_level {
            1 => m.buffered_bitmaps.get(&(entry_id as u32)).cloned(),
            0 => {
                let sn = (entry_id / capacity) as u32;
                let slot = (entry_id % capacity) as usize;
                m.buffered_bitmaps
                    .get(&sn)
                    .and_then(|leaves| leaves.get(slot))
                    .and_then(|leaf| leaf.clone())
                    .map(|bits| vec![Some(bits)])
            }
            _ => None,
        }
    }

    fn enqueue_entries(
        &mut self,
        member: usize,
        node: &Node,
        bitmap: Option<&LeafBitmaps>,
        child_base: u64,
    ) {
        let has_text = !self.text_predicates.is_empty();

        if node.is_leaf() && has_text {
            // Only bitmap-selected slots of this leaf are candidates.
            let Some(leaf_bits) = bitmap.and_then(|b| b.first()).and_then(|b| b.as_ref()) else {
                return;
            };

            let mut next = leaf_bits.next_set_bit(0);
            while let Some(slot) = next {
                if slot >= node.len() {
                    break;
                }
                let entry = &node.entries[slot];
                let distance = entry.rect.distance(&self.query_point);
                let range_ok = entry
                    .num_range
                    .as_ref()
                    .map_or(true, |r| self.range_satisfies_predicates(r));

                if distance <= self.distance_limit && range_ok {
                    self.queue.push(SearchEntry {
                        child: entry.child,
                        distance,
                        points_to_inner: false,
                        node_level: 0,
                        entry_id: child_base + slot as u64,
                        member,
                    });
                }
                next = leaf_bits.next_set_bit(slot + 1);
            }
            return;
        }

        for (i, entry) in node.entries.iter().enumerate() {
            let distance = entry.rect.distance(&self.query_point);
            if distance > self.distance_limit {
                continue;
            }
            if let Some(range) = &entry.num_range {
                if !self.range_satisfies_predicates(range) {
                    continue;
                }
            }
            if node.level == 1 && has_text {
                // Prune leaves whose bitmap slice is empty.
                let candidate = bitmap
                    .and_then(|leaves| leaves.get(i))
                    .and_then(|leaf| leaf.as_ref())
                    .is_some_and(|bits| !bits.is_empty());
                if !candidate {
                    continue;
                }
            }

            self.queue.push(SearchEntry {
                child: entry.child,
                distance,
                points_to_inner: node.level != 0,
                node_level: node.level.saturating_sub(1),
                entry_id: child_base + i as u64,
                member,
            });
        }
    }
}

impl Iterator for ResultIterator {
    type Item = IndexResult<ScoredRecord>;

    /// Yields records nearest-first. A read error ends the iteration after
    /// surfacing once.
    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.yielded >= self.top_k {
            return None;
        }

        loop {
            let entry = match self.advance() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let record = match self.members[entry.member]
                .dataset_reader
                .record_at(entry.child)
            {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if !self.record_satisfies_predicates(&record) {
                continue;
            }

            self.yielded += 1;
            return Some(Ok(ScoredRecord {
                record,
                distance: entry.distance,
                member: entry.member,
            }));
        }
    }
}
