//! Query-ready index handles.
//!
//! [`SpatialKeywordIndex`] wires the persisted pieces of one category
//! together: the tree snapshot, the node file, the bitmap store and the
//! dataset. [`FederatedIndex`] stitches several of them under a synthetic
//! merge root so one best-first search ranks records across categories.

mod manager;

pub use manager::{
    IndexManager, IndexSnapshot, BITMAP_SUFFIX, DATA_SUFFIX, HEADER_SUFFIX, NODES_SUFFIX,
    NODE_MAP_SUFFIX, SNAPSHOT_SUFFIX,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::dataset::{Dataset, RandomDatasetReader};
use crate::errors::{IndexError, IndexResult};
use crate::query::{QueryMember, QuerySpec, ResultIterator};
use crate::rtree::{Node, NodeOffsetMap, NodeRef, RtreeSnapshot};
use crate::sif::SpatialInvertedFile;

/// Tree levels pinned in memory when an index opens.
const PRELOAD_LEVELS: u16 = 3;

/// Bitmap-store entries touched at open to warm the page cache.
const WARM_UP_ENTRIES: usize = 10_000;

/// Common searchable-index surface, whether backed by one category or a
/// federation of them.
pub trait Index {
    fn dataset(&self) -> &Dataset;

    fn search(&self, query: &QuerySpec) -> IndexResult<ResultIterator>;

    /// Node pages read from disk since the last reset.
    fn spatial_io_reads(&self) -> u64;

    /// Bitmap bundles read from the store since the last reset.
    fn text_io_reads(&self) -> u64;

    fn reset_io_reads(&self);

    /// Releases the underlying stores; the index serves no further queries.
    fn close(&self) -> IndexResult<()>;
}

// ============================================================================
// Single-category index
// ============================================================================

pub struct SpatialKeywordIndex {
    dataset: Dataset,
    snapshot: Arc<RtreeSnapshot>,
    sif: Arc<SpatialInvertedFile>,
    offsets: Arc<NodeOffsetMap>,
    preloaded: Arc<HashMap<NodeRef, Node>>,
    manager: IndexManager,
    node_io_reads: Arc<AtomicU64>,
    last_built: DateTime<Utc>,
}

impl SpatialKeywordIndex {
    /// Opens the category's persisted files for serving.
    pub fn open(manager: IndexManager) -> IndexResult<Self> {
        let IndexSnapshot {
            dataset,
            tree,
            last_built,
        } = manager.read_snapshot()?;

        let snapshot = Arc::new(tree);
        let offsets = Arc::new(manager.load_node_map()?);

        let store = manager.open_bitmap_store()?;
        store.warm_up(WARM_UP_ENTRIES)?;
        let boundaries =
            (!snapshot.boundaries().is_empty()).then(|| snapshot.boundaries().clone());
        let sif = Arc::new(SpatialInvertedFile::new(
            store,
            snapshot.capacity(),
            boundaries,
        ));

        let mut reader = manager.open_node_reader(Arc::clone(&offsets))?;
        let preloaded = Arc::new(manager.preload_upper_nodes(
            &mut reader,
            snapshot.root(),
            PRELOAD_LEVELS,
        )?);

        log::info!(
            "category {}: index open, height {}, built {}",
            manager.category(),
            snapshot.height(),
            last_built
        );

        Ok(Self {
            dataset,
            snapshot,
            sif,
            offsets,
            preloaded,
            manager,
            node_io_reads: Arc::new(AtomicU64::new(0)),
            last_built,
        })
    }

    pub fn category(&self) -> &str {
        self.manager.category()
    }

    pub fn snapshot(&self) -> &RtreeSnapshot {
        &self.snapshot
    }

    pub fn last_built(&self) -> DateTime<Utc> {
        self.last_built
    }

    /// Fresh per-query state: its own node and dataset file handles over the
    /// shared read-only structures.
    fn query_member(&self) -> IndexResult<QueryMember> {
        Ok(QueryMember::new(
            Arc::clone(&self.snapshot),
            Arc::clone(&self.sif),
            Arc::clone(&self.preloaded),
            self.manager.open_node_reader(Arc::clone(&self.offsets))?,
            RandomDatasetReader::open(&self.dataset)?,
            Arc::clone(&self.node_io_reads),
        ))
    }
}

impl Index for SpatialKeywordIndex {
    fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn search(&self, query: &QuerySpec) -> IndexResult<ResultIterator> {
        ResultIterator::single(self.query_member()?, query)
    }

    fn spatial_io_reads(&self) -> u64 {
        self.node_io_reads.load(Ordering::Relaxed)
    }

    fn text_io_reads(&self) -> u64 {
        self.sif.store().io_reads()
    }

    fn reset_io_reads(&self) {
        self.node_io_reads.store(0, Ordering::Relaxed);
        self.sif.store().reset_io_reads();
    }

    fn close(&self) -> IndexResult<()> {
        self.sif.store().close()
    }
}

// ============================================================================
// Federated index
// ============================================================================

/// Several single-category indexes searched as one. A synthetic root node
/// holds one entry per member, carrying the member root's bounding rectangle
/// and aggregated numeric ranges, so the shared best-first loop prunes whole
/// members the same way it prunes subtrees.
pub struct FederatedIndex {
    members: Vec<SpatialKeywordIndex>,
    merged_root: Node,
}

impl FederatedIndex {
    pub fn new(members: Vec<SpatialKeywordIndex>) -> IndexResult<Self> {
        if members.is_empty() {
            return Err(IndexError::InvalidArgument(
                "a federated index needs at least one member".into(),
            ));
        }

        let level = members
            .iter()
            .map(|m| m.snapshot().height())
            .max()
            .unwrap_or(1);
        let mut merged_root = Node::new(0, level);

        for member in &members {
            let root = member.snapshot().root();
            merged_root.push(
                root.id,
                root.min_bounding_rect(),
                root.aggregate_numeric_range(member.snapshot().num_field_count()),
            );
        }

        Ok(Self {
            members,
            merged_root,
        })
    }

    pub fn members(&self) -> &[SpatialKeywordIndex] {
        &self.members
    }
}

impl Index for FederatedIndex {
    /// The first member's dataset; callers wanting per-member datasets go
    /// through [`FederatedIndex::members`].
    fn dataset(&self) -> &Dataset {
        self.members[0].dataset()
    }

    fn search(&self, query: &QuerySpec) -> IndexResult<ResultIterator> {
        let members = self
            .members
            .iter()
            .map(|m| m.query_member())
            .collect::<IndexResult<Vec<_>>>()?;
        ResultIterator::federated(members, &self.merged_root, query)
    }

    fn spatial_io_reads(&self) -> u64 {
        self.members.iter().map(|m| m.spatial_io_reads()).sum()
    }

    fn text_io_reads(&self) -> u64 {
        self.members.iter().map(|m| m.text_io_reads()).sum()
    }

    fn reset_io_reads(&self) {
        for member in &self.members {
            member.reset_io_reads();
        }
    }

    fn close(&self) -> IndexResult<()> {
        for member in &self.members {
            member.close()?;
        }
        Ok(())
    }
}
