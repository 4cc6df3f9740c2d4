//! Spatial inverted file: per-term, per-super-node keyword bitmaps.
//!
//! Build side consumes a globally sorted `(term, field, entry_id)` triple
//! stream and stores one [`SuperNodeBitmap`] per (term, super node) run.
//! Query side resolves, for a super-node interval, the smallest super node
//! where a predicate set is satisfied, walking one ordered store cursor per
//! keyword and combining bitmaps algebraically (AND/OR/NOT).

mod supernode_bitmap;

pub use supernode_bitmap::SuperNodeBitmap;

use std::collections::HashMap;
use std::io::BufRead;

use crate::bitmap::{BitVec, CompressedBitmap};
use crate::errors::{IndexError, IndexResult};
use crate::query::{ComparisonOperator, SnInterval, TextPredicate};
use crate::rtree::SuperNodeBoundary;
use crate::store::{BitmapCursor, BitmapStore, TermAtSuperNode};

/// A super-node bitmap decomposed into one bit vector per child leaf node;
/// `None` marks a leaf with no candidates.
pub type LeafBitmaps = Vec<Option<BitVec>>;

pub struct SpatialInvertedFile {
    store: BitmapStore,
    m: usize,
    super_node_size: usize,
    /// Per-leaf occupancy per super node; `None` when the tree is too small
    /// to have recorded boundaries (every super-node id is then taken as
    /// valid and no cleansing is possible or needed).
    boundaries: Option<HashMap<u32, SuperNodeBoundary>>,
    all_set: BitVec,
}

impl SpatialInvertedFile {
    pub fn new(
        store: BitmapStore,
        fanout: u16,
        boundaries: Option<HashMap<u32, SuperNodeBoundary>>,
    ) -> Self {
        let m = fanout as usize;
        let super_node_size = m * m;
        let mut all_set = BitVec::new(super_node_size);
        all_set.set_range(0, super_node_size);

        Self {
            store,
            m,
            super_node_size,
            boundaries,
            all_set,
        }
    }

    pub fn store(&self) -> &BitmapStore {
        &self.store
    }

    pub fn super_node_size(&self) -> usize {
        self.super_node_size
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Consumes sorted `term \t field \t entry_id` rows and stores one
    /// bitmap bundle per (term, super node) run. Returns the number of
    /// bundles written. The input must be sorted by term, then entry id —
    /// an unsorted stream silently fragments bundles, which the external
    /// sort step rules out.
    pub fn build_term_bitmaps(&self, input: impl BufRead) -> IndexResult<u64> {
        let mut current: Option<(String, u32)> = None;
        let mut field_bits: HashMap<u16, BitVec> = HashMap::new();
        let mut bundles_written = 0u64;

        for line in input.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split('\t');
            let (term, field, entry_id) = match (parts.next(), parts.next(), parts.next()) {
                (Some(t), Some(f), Some(e)) => {
                    let field: u16 = f.parse().map_err(|_| {
                        IndexError::MalformedRecord(format!("bad field number in row: {line}"))
                    })?;
                    let entry_id: u64 = e.parse().map_err(|_| {
                        IndexError::MalformedRecord(format!("bad entry id in row: {line}"))
                    })?;
                    (t, field, entry_id)
                }
                _ => {
                    return Err(IndexError::MalformedRecord(format!(
                        "expected 3 tab-separated columns: {line}"
                    )))
                }
            };

            let sn = (entry_id / self.super_node_size as u64) as u32;
            let bit = (entry_id % self.super_node_size as u64) as usize;

            match &current {
                Some((t, s)) if t == term && *s == sn => {}
                _ => {
                    if let Some((prev_term, prev_sn)) = current.take() {
                        self.flush_bundle(&prev_term, prev_sn, &field_bits)?;
                        bundles_written += 1;
                    }
                    field_bits.clear();
                    current = Some((term.to_owned(), sn));
                }
            }

            field_bits
                .entry(field)
                .or_insert_with(|| BitVec::new(self.super_node_size))
                .set(bit);
        }

        if let Some((term, sn)) = current.take() {
            self.flush_bundle(&term, sn, &field_bits)?;
            bundles_written += 1;
        }

        self.store.commit()?;
        log::info!("built {bundles_written} term bitmap bundles");
        Ok(bundles_written)
    }

    fn flush_bundle(
        &self,
        term: &str,
        sn: u32,
        field_bits: &HashMap<u16, BitVec>,
    ) -> IndexResult<()> {
        if field_bits.is_empty() {
            return Ok(());
        }
        self.store
            .insert(term, sn, &SuperNodeBitmap::new(field_bits))
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// A super node is valid when it actually groups leaf nodes. Without
    /// boundary info every id must be assumed valid.
    fn is_sn_valid(&self, sn: u32) -> bool {
        match &self.boundaries {
            Some(b) => b.contains_key(&sn),
            None => true,
        }
    }

    fn first_valid_sn(&self, interval: SnInterval) -> Option<u32> {
        match &self.boundaries {
            Some(b) => b
                .keys()
                .copied()
                .filter(|&sn| sn >= interval.start && sn <= interval.end)
                .min(),
            None => Some(interval.start),
        }
    }

    /// Masks off bits past the true occupancy of each leaf node in the
    /// super node. `None` when nothing survives.
    fn cleanse(&self, sn: u32, mut bits: BitVec) -> Option<CompressedBitmap> {
        if let Some(boundary) = self.boundaries.as_ref().and_then(|b| b.get(&sn)) {
            for i in 0..boundary.len() {
                let occupancy = boundary.get(i) as usize;
                if occupancy == self.m {
                    continue;
                }
                bits.clear_range(i * self.m + occupancy, (i + 1) * self.m);
            }
            // Leaf slots past the last grouped node do not exist.
            bits.clear_range(boundary.len() * self.m, self.super_node_size);
        }

        if bits.cardinality() == 0 {
            None
        } else {
            Some(CompressedBitmap::from_bitvec(&bits))
        }
    }

    fn cleansed_all_set(&self, sn: u32) -> Option<CompressedBitmap> {
        self.cleanse(sn, self.all_set.clone())
    }

    /// Finds the smallest super node in `interval` satisfying every
    /// predicate simultaneously, short-circuiting across predicates: a
    /// predicate that reports "nothing before super node N" lets the scan
    /// jump straight to N. On success returns the qualifying id and the
    /// combined bitmap partitioned per leaf node.
    pub fn query_supernode_bitmap(
        &self,
        interval: SnInterval,
        predicates: &[TextPredicate],
    ) -> IndexResult<Option<(u32, LeafBitmaps)>> {
        if predicates.is_empty() {
            return Ok(None);
        }

        let end = interval.end;
        let mut curr = match self.first_valid_sn(interval) {
            Some(sn) => sn,
            None => return Ok(None),
        };

        let mut combined: Option<CompressedBitmap> = None;
        let mut last_evaluated: Option<usize> = None;
        let mut matches = 0usize;

        'outer: while curr <= end {
            if !self.is_sn_valid(curr) {
                curr = match self.first_valid_sn(SnInterval::new(curr, end)) {
                    Some(sn) => sn,
                    None => return Ok(None),
                };
            }

            let mut i = 0;
            while i < predicates.len() {
                if last_evaluated == Some(i) {
                    last_evaluated = None;
                    i += 1;
                    continue;
                }

                let predicate = &predicates[i];
                let sub_interval = SnInterval::new(curr, end);
                let found = match predicate.op {
                    ComparisonOperator::Equal => self.and_semantics(predicate, sub_interval)?,
                    ComparisonOperator::NotEqual => self.not_semantics(predicate, sub_interval)?,
                    ComparisonOperator::Or => self.or_semantics(predicate, sub_interval)?,
                    _ => None,
                };

                let (at_sn, bitmap) = match found {
                    Some(hit) => hit,
                    None => return Ok(None),
                };

                if at_sn == curr {
                    combined = match combined.take() {
                        None => Some(bitmap),
                        Some(acc) => {
                            last_evaluated = None;
                            acc.and(&bitmap, self.super_node_size)
                        }
                    };

                    match &combined {
                        None => {
                            curr += 1;
                            last_evaluated = None;
                            matches = 0;
                            continue 'outer;
                        }
                        Some(_) => {
                            matches += 1;
                            if matches == predicates.len() {
                                break;
                            }
                        }
                    }
                    i += 1;
                } else {
                    // This predicate has no candidate before at_sn: jump.
                    combined = Some(bitmap);
                    last_evaluated = Some(i);
                    matches = 1;
                    curr = at_sn;
                    continue 'outer;
                }
            }

            if matches == predicates.len() {
                if let Some(bitmap) = combined.take() {
                    return Ok(Some((curr, self.partition_per_leaf(&bitmap))));
                }
            }
        }

        Ok(None)
    }

    /// Splits a super-node bitmap into M leaf-node slices.
    fn partition_per_leaf(&self, bitmap: &CompressedBitmap) -> LeafBitmaps {
        let bits = bitmap.to_bitvec(self.super_node_size);
        (0..self.m)
            .map(|i| {
                let slice = bits.slice(i * self.m, (i + 1) * self.m);
                (!slice.is_empty()).then_some(slice)
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Per-predicate semantics
    // ------------------------------------------------------------------------

    /// AND of keywords: the smallest super node in the interval where every
    /// keyword has a non-empty bitmap, with the keyword cursors leap-frogging
    /// each other.
    fn and_semantics(
        &self,
        predicate: &TextPredicate,
        interval: SnInterval,
    ) -> IndexResult<Option<(u32, CompressedBitmap)>> {
        let terms = predicate.keywords();
        let n = terms.len();
        let end = interval.end;
        let mut curr = interval.start;
        let mut cursors: Vec<BitmapCursor> = Vec::with_capacity(n);

        // Position one cursor per keyword; any keyword with no posting in
        // the interval fails the whole conjunction.
        for term in terms {
            let mut cursor = self
                .store
                .browse_from(&TermAtSuperNode::new(term.clone(), curr))?;

            let sn = match probe(&mut cursor, term, predicate.field())? {
                Probe::Gone => return Ok(None),
                Probe::At { sn, .. } => sn,
            };
            if sn > end {
                return Ok(None);
            }
            if sn > curr {
                curr = sn;
            }
            cursors.push(cursor);
        }

        let mut acc: Option<CompressedBitmap> = None;
        let mut matches = 0usize;
        let mut last_found: Option<usize> = None;

        'outer: while curr <= end {
            let mut i = 0;
            while i < n {
                if last_found == Some(i) {
                    last_found = None;
                    i += 1;
                    continue;
                }

                // Scan this keyword's postings up to a usable bitmap.
                let term_bitmap = loop {
                    let (sn, bitmap) = match probe(&mut cursors[i], &terms[i], predicate.field())? {
                        Probe::Gone => return Ok(None),
                        Probe::At { sn, bitmap } => (sn, bitmap),
                    };

                    if sn > end {
                        return Ok(None);
                    }
                    if sn < curr {
                        // Stale posting behind the scan position.
                        cursors[i].advance();
                        continue;
                    }
                    cursors[i].advance();

                    match bitmap {
                        Some(bm) if sn == curr => break bm,
                        Some(bm) => {
                            // Keyword absent until sn: restart there,
                            // keeping this keyword's bitmap in hand.
                            curr = sn;
                            acc = Some(bm);
                            matches = 1;
                            last_found = Some(i);
                            continue 'outer;
                        }
                        None if sn > curr => {
                            // Field missing at sn: nothing can match there.
                            curr = sn + 1;
                            acc = None;
                            matches = 0;
                            last_found = None;
                            continue 'outer;
                        }
                        None => continue,
                    }
                };

                acc = match acc.take() {
                    None => Some(term_bitmap),
                    Some(prev) => {
                        last_found = None;
                        prev.and(&term_bitmap, self.super_node_size)
                    }
                };

                match &acc {
                    None => {
                        matches = 0;
                        last_found = None;
                        curr += 1;
                        continue 'outer;
                    }
                    Some(_) => {
                        matches += 1;
                        if matches == n {
                            break;
                        }
                    }
                }
                i += 1;
            }

            if matches == n {
                if let Some(bitmap) = acc.take() {
                    return Ok(Some((curr, bitmap)));
                }
            }
        }

        Ok(None)
    }

    /// OR of keywords: the smallest super node where at least one keyword
    /// has a non-empty bitmap. Postings are only consumed once the scan has
    /// reached their super node, so nothing is lost when the scan jumps.
    fn or_semantics(
        &self,
        predicate: &TextPredicate,
        interval: SnInterval,
    ) -> IndexResult<Option<(u32, CompressedBitmap)>> {
        let terms = predicate.keywords();
        let n = terms.len();
        let end = interval.end;
        let mut curr = end + 1;
        let mut cursors: Vec<BitmapCursor> = Vec::with_capacity(n);
        let mut exhausted = vec![false; n];

        for (i, term) in terms.iter().enumerate() {
            let mut cursor = self
                .store
                .browse_from(&TermAtSuperNode::new(term.clone(), interval.start))?;

            match probe(&mut cursor, term, predicate.field())? {
                Probe::Gone => exhausted[i] = true,
                Probe::At { sn, .. } => {
                    if sn > end {
                        exhausted[i] = true;
                    } else if sn < curr {
                        curr = sn;
                    }
                }
            }
            cursors.push(cursor);
        }

        if exhausted.iter().all(|&e| e) {
            return Ok(None);
        }

        while curr <= end {
            let mut acc: Option<CompressedBitmap> = None;
            let mut next_sn = end;

            for i in 0..n {
                if exhausted[i] {
                    continue;
                }

                loop {
                    let (sn, bitmap) = match probe(&mut cursors[i], &terms[i], predicate.field())? {
                        Probe::Gone => {
                            exhausted[i] = true;
                            break;
                        }
                        Probe::At { sn, bitmap } => (sn, bitmap),
                    };

                    if sn > end {
                        exhausted[i] = true;
                        break;
                    }
                    if sn < curr {
                        cursors[i].advance();
                        continue;
                    }
                    if sn > curr {
                        // Not this keyword's turn; leave the posting for a
                        // later pass.
                        next_sn = next_sn.min(sn);
                        break;
                    }

                    cursors[i].advance();
                    if let Some(bm) = bitmap {
                        acc = Some(match acc.take() {
                            None => bm,
                            Some(prev) => prev.or(&bm, self.super_node_size),
                        });
                    }
                    break;
                }
            }

            if let Some(bitmap) = acc {
                if bitmap.cardinality() > 0 {
                    return Ok(Some((curr, bitmap)));
                }
            }

            curr = if next_sn > curr + 1 { next_sn } else { curr + 1 };
        }

        Ok(None)
    }

    /// NOT of keywords: the smallest super node holding at least one record
    /// that matches none of the keywords. A keyword with no posting at a
    /// super node contributes "all bits set"; present postings are flipped.
    /// Every produced bitmap is cleansed to true leaf occupancy, so flipped
    /// bits past a leaf's real size never surface as candidates.
    fn not_semantics(
        &self,
        predicate: &TextPredicate,
        interval: SnInterval,
    ) -> IndexResult<Option<(u32, CompressedBitmap)>> {
        let terms = predicate.keywords();
        let n = terms.len();
        let end = interval.end;
        let mut cursors: Vec<BitmapCursor> = Vec::with_capacity(n);

        for term in terms {
            cursors.push(
                self.store
                    .browse_from(&TermAtSuperNode::new(term.clone(), interval.start))?,
            );
        }

        // NOT qualifies almost everywhere, so the scan visits every valid
        // super node from the start of the interval.
        let mut curr = match self.first_valid_sn(interval) {
            Some(sn) => sn,
            None => return Ok(None),
        };

        'outer: while curr <= end {
            if !self.is_sn_valid(curr) {
                match self.first_valid_sn(SnInterval::new(curr, end)) {
                    Some(sn) => curr = sn,
                    None => return Ok(None),
                }
            }

            let mut acc: Option<CompressedBitmap> = None;
            let mut matches = 0usize;

            for i in 0..n {
                let term_bitmap = loop {
                    let (sn, bitmap) = match probe(&mut cursors[i], &terms[i], predicate.field())? {
                        Probe::Gone => break self.cleansed_all_set(curr),
                        Probe::At { sn, bitmap } => (sn, bitmap),
                    };

                    if sn > end {
                        break self.cleansed_all_set(curr);
                    }
                    if sn < curr {
                        cursors[i].advance();
                        continue;
                    }
                    if sn > curr {
                        // No posting at curr: every record here fails the
                        // keyword. Leave the posting in place.
                        break self.cleansed_all_set(curr);
                    }

                    cursors[i].advance();
                    break match bitmap {
                        Some(bm) => {
                            let mut flipped = bm.to_bitvec(self.super_node_size);
                            flipped.flip_all();
                            self.cleanse(curr, flipped)
                        }
                        // Posting exists but not for the target field.
                        None => self.cleansed_all_set(curr),
                    };
                };

                let term_bitmap = match term_bitmap {
                    Some(bm) => bm,
                    None => {
                        curr += 1;
                        continue 'outer;
                    }
                };

                acc = match acc.take() {
                    None => Some(term_bitmap),
                    Some(prev) => prev.and(&term_bitmap, self.super_node_size),
                };

                match &acc {
                    None => {
                        curr += 1;
                        continue 'outer;
                    }
                    Some(_) => matches += 1,
                }
            }

            if matches == n {
                if let Some(bitmap) = acc.take() {
                    return Ok(Some((curr, bitmap)));
                }
            }
            curr += 1;
        }

        Ok(None)
    }
}

// ============================================================================
// Cursor probing
// ============================================================================

enum Probe {
    /// Cursor exhausted, or positioned on a different term.
    Gone,
    At {
        sn: u32,
        /// Bitmap for the predicate's field; `None` when the bundle has no
        /// bitmap for that field.
        bitmap: Option<CompressedBitmap>,
    },
}

/// Looks at the cursor's next posting without consuming it.
fn probe(cursor: &mut BitmapCursor, term: &str, field: Option<u16>) -> IndexResult<Probe> {
    match cursor.peek()? {
        None => Ok(Probe::Gone),
        Some((key, bundle)) => {
            if key.term != term {
                return Ok(Probe::Gone);
            }
            let bitmap = match field {
                None => bundle.any_field().cloned(),
                Some(f) => bundle.field_bitmap(f).cloned(),
            };
            Ok(Probe::At {
                sn: key.super_node,
                bitmap,
            })
        }
    }
}
