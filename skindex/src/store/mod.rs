//! Persistent, sorted storage for per-term super-node bitmaps.
//!
//! The store maps a [`TermAtSuperNode`] key to a [`SuperNodeBitmap`] bundle.
//! Keys are encoded so that fjall's lexicographic byte ordering equals the
//! logical ordering (term ascending, then super-node id ascending) — the
//! cursor walks in the spatial inverted file depend on this.
//!
//! Writes are buffered and committed in bounded batches so a bulk build does
//! not accumulate the whole posting set in memory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fjall::{Keyspace, Partition, PartitionCreateOptions, PersistMode, Slice};
use parking_lot::Mutex;

use crate::errors::{IndexError, IndexResult};
use crate::sif::SuperNodeBitmap;

/// How many buffered inserts trigger an automatic commit during a build.
/// Larger values trade memory for fewer journal syncs.
pub const DEFAULT_COMMIT_INTERVAL: usize = 200_000;

const KEY_SEPARATOR: u8 = 0x00;

// ============================================================================
// Key encoding
// ============================================================================

/// The sort/lookup key of the bitmap store: a term at a super node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TermAtSuperNode {
    pub term: String,
    pub super_node: u32,
}

impl TermAtSuperNode {
    pub fn new(term: impl Into<String>, super_node: u32) -> Self {
        Self {
            term: term.into(),
            super_node,
        }
    }

    /// Encodes as `term ++ 0x00 ++ big-endian id`. Terms are cleansed text
    /// and never contain NUL, so the separator is unambiguous; the big-endian
    /// suffix makes byte order agree with numeric id order.
    pub fn encode(&self) -> Vec<u8> {
        let term_bytes = self.term.as_bytes();
        let mut out = Vec::with_capacity(term_bytes.len() + 5);
        out.extend_from_slice(term_bytes);
        out.push(KEY_SEPARATOR);
        out.extend_from_slice(&self.super_node.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> IndexResult<Self> {
        if bytes.len() < 5 || bytes[bytes.len() - 5] != KEY_SEPARATOR {
            return Err(IndexError::Serialization(
                "malformed term-at-super-node key".into(),
            ));
        }

        let (term_bytes, suffix) = bytes.split_at(bytes.len() - 5);
        let term = String::from_utf8(term_bytes.to_vec())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        let id_bytes: [u8; 4] = suffix[1..].try_into().expect("4-byte id suffix");

        Ok(Self {
            term,
            super_node: u32::from_be_bytes(id_bytes),
        })
    }
}

// ============================================================================
// BitmapStore
// ============================================================================

/// A sorted persistent map from (term, super node) to bitmap bundles,
/// backed by a fjall partition.
pub struct BitmapStore {
    keyspace: Keyspace,
    partition: Partition,
    path: PathBuf,
    pending: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    commit_interval: usize,
    io_reads: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl BitmapStore {
    /// Opens (or creates) the bitmap store for one category.
    pub fn open(category: &str, index_path: &Path) -> IndexResult<Self> {
        let path = index_path.join(category).join(format!("{category}.bitmaps"));
        let keyspace = Keyspace::open(fjall::Config::new(&path))?;
        let partition = keyspace.open_partition("bitmaps", PartitionCreateOptions::default())?;

        log::debug!("opened bitmap store at {}", path.display());

        Ok(Self {
            keyspace,
            partition,
            path,
            pending: Mutex::new(Vec::new()),
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            io_reads: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_commit_interval(mut self, interval: usize) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> IndexResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    /// Upserts a bitmap bundle. Writes are buffered; every
    /// `commit_interval` inserts the buffer is committed automatically.
    pub fn insert(&self, term: &str, super_node: u32, bundle: &SuperNodeBitmap) -> IndexResult<()> {
        self.check_open()?;

        let key = TermAtSuperNode::new(term, super_node).encode();
        let value = bincode::serde::encode_to_vec(bundle, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let flush = {
            let mut pending = self.pending.lock();
            pending.push((key, value));
            pending.len() >= self.commit_interval
        };

        if flush {
            self.commit()?;
        }

        Ok(())
    }

    /// Flushes all buffered writes in one atomic batch and persists the
    /// journal.
    pub fn commit(&self) -> IndexResult<()> {
        self.check_open()?;

        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(());
        }

        let mut batch = self.keyspace.batch();
        for (key, value) in pending {
            batch.insert(&self.partition, key, value);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        Ok(())
    }

    /// Exact lookup of one bitmap bundle.
    pub fn find_exact(&self, key: &TermAtSuperNode) -> IndexResult<Option<SuperNodeBitmap>> {
        self.check_open()?;
        self.io_reads.fetch_add(1, Ordering::Relaxed);

        match self.partition.get(key.encode())? {
            Some(bytes) => Ok(Some(decode_bundle(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns a cursor positioned at the first entry with key >= `key`,
    /// yielding entries in ascending key order.
    pub fn browse_from(&self, key: &TermAtSuperNode) -> IndexResult<BitmapCursor> {
        self.check_open()?;

        let iter = self.partition.range(key.encode()..);
        Ok(BitmapCursor {
            iter: Box::new(iter),
            peeked: None,
            io_reads: Arc::clone(&self.io_reads),
        })
    }

    /// Touches up to `entries` entries to pull them into the page cache so
    /// the first queries after a reload do not pay cold-read latency.
    pub fn warm_up(&self, entries: usize) -> IndexResult<()> {
        self.check_open()?;
        for kv in self.partition.iter().take(entries) {
            let _ = kv?;
        }
        Ok(())
    }

    pub fn io_reads(&self) -> u64 {
        self.io_reads.load(Ordering::Relaxed)
    }

    pub fn reset_io_reads(&self) {
        self.io_reads.store(0, Ordering::Relaxed);
    }

    /// Commits outstanding writes and marks the store closed.
    pub fn close(&self) -> IndexResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }

        self.commit()?;
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn decode_bundle(bytes: &[u8]) -> IndexResult<SuperNodeBitmap> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(bundle, _)| bundle)
        .map_err(|e| IndexError::Serialization(e.to_string()))
}

// ============================================================================
// BitmapCursor
// ============================================================================

type RawEntry = fjall::Result<(Slice, Slice)>;

/// An ordered cursor over bitmap-store entries.
///
/// `peek` decodes the next entry without consuming it; `advance` consumes.
/// This mirrors the browse-then-reposition pattern the inverted-file walks
/// rely on: a walk may look at a posting, decide it belongs to a later super
/// node, and leave it in place for a later pass.
pub struct BitmapCursor {
    iter: Box<dyn Iterator<Item = RawEntry>>,
    peeked: Option<(TermAtSuperNode, SuperNodeBitmap)>,
    io_reads: Arc<AtomicU64>,
}

impl BitmapCursor {
    /// The next entry in key order, without consuming it.
    pub fn peek(&mut self) -> IndexResult<Option<&(TermAtSuperNode, SuperNodeBitmap)>> {
        if self.peeked.is_none() {
            match self.iter.next() {
                Some(kv) => {
                    let (key_bytes, value_bytes) = kv?;
                    self.io_reads.fetch_add(1, Ordering::Relaxed);
                    let key = TermAtSuperNode::decode(&key_bytes)?;
                    let bundle = decode_bundle(&value_bytes)?;
                    self.peeked = Some((key, bundle));
                }
                None => return Ok(None),
            }
        }

        Ok(self.peeked.as_ref())
    }

    /// Consumes the entry `peek` would return.
    pub fn advance(&mut self) {
        if self.peeked.take().is_none() {
            if self.iter.next().is_some() {
                self.io_reads.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
