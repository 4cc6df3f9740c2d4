//! Fixed-size bit vectors and word-aligned compressed bitmaps.
//!
//! A [`CompressedBitmap`] is the unit stored per (term, super node) pair in
//! the bitmap store. Runs of identical 64-bit words are stored once with a
//! repeat count, so the all-zero and all-one stretches that dominate sparse
//! postings collapse to a single run. Random access requires sequential
//! decoding, which is why all callers operate at the fixed super-node
//! granularity and decompress at most one super node at a time.

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

// ============================================================================
// BitVec
// ============================================================================

/// An uncompressed, fixed-capacity bit vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    nbits: usize,
}

impl BitVec {
    /// Creates an all-zero bit vector holding `nbits` bits.
    pub fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(WORD_BITS)],
            nbits,
        }
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
    }

    pub fn get(&self, bit: usize) -> bool {
        if bit >= self.nbits {
            return false;
        }
        self.words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0
    }

    /// Sets all bits in `[from, to)`.
    pub fn set_range(&mut self, from: usize, to: usize) {
        for bit in from..to.min(self.nbits) {
            self.set(bit);
        }
    }

    /// Clears all bits in `[from, to)`.
    pub fn clear_range(&mut self, from: usize, to: usize) {
        for bit in from..to.min(self.nbits) {
            self.words[bit / WORD_BITS] &= !(1u64 << (bit % WORD_BITS));
        }
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Index of the first set bit at or after `from`, if any.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        if from >= self.nbits {
            return None;
        }

        let mut word_idx = from / WORD_BITS;
        let mut word = self.words[word_idx] & (u64::MAX << (from % WORD_BITS));

        loop {
            if word != 0 {
                let bit = word_idx * WORD_BITS + word.trailing_zeros() as usize;
                return (bit < self.nbits).then_some(bit);
            }

            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// In-place intersection. Both vectors must have the same length.
    pub fn and_assign(&mut self, other: &BitVec) {
        debug_assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    /// In-place union. Both vectors must have the same length.
    pub fn or_assign(&mut self, other: &BitVec) {
        debug_assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// Flips every bit below `nbits`.
    pub fn flip_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self.mask_tail();
    }

    /// Copies bits `[start, end)` into a new vector of length `end - start`.
    pub fn slice(&self, start: usize, end: usize) -> BitVec {
        let mut out = BitVec::new(end - start);
        let mut bit = self.next_set_bit(start);
        while let Some(b) = bit {
            if b >= end {
                break;
            }
            out.set(b - start);
            bit = self.next_set_bit(b + 1);
        }
        out
    }

    // Bits past nbits in the last word must stay zero.
    fn mask_tail(&mut self) {
        let rem = self.nbits % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    fn words(&self) -> &[u64] {
        &self.words
    }
}

// ============================================================================
// CompressedBitmap
// ============================================================================

/// One run of identical words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Run {
    word: u64,
    len: u32,
}

/// A word-aligned run-length compressed bitmap.
///
/// Immutable once built; `and`/`or`/`flip` allocate fresh results. An `and`
/// or `or` whose result has no set bits is reported as `None` — callers must
/// treat that as "no candidates", not as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedBitmap {
    runs: Vec<Run>,
}

impl CompressedBitmap {
    /// Compresses an uncompressed bit vector.
    pub fn from_bitvec(bv: &BitVec) -> Self {
        let mut runs: Vec<Run> = Vec::new();

        for &word in bv.words() {
            match runs.last_mut() {
                Some(run) if run.word == word && run.len < u32::MAX => run.len += 1,
                _ => runs.push(Run { word, len: 1 }),
            }
        }

        // Trailing zero runs carry no information; decompression pads.
        while matches!(runs.last(), Some(run) if run.word == 0) {
            runs.pop();
        }

        Self { runs }
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> usize {
        self.runs
            .iter()
            .map(|r| r.word.count_ones() as usize * r.len as usize)
            .sum()
    }

    /// Decompresses into a bit vector of `nbits` bits.
    pub fn to_bitvec(&self, nbits: usize) -> BitVec {
        let mut out = BitVec::new(nbits);
        let mut idx = 0usize;

        for run in &self.runs {
            for _ in 0..run.len {
                if idx < out.words.len() {
                    out.words[idx] = run.word;
                }
                idx += 1;
            }
        }

        out.mask_tail();
        out
    }

    /// Intersection at `nbits` granularity; `None` when the result is empty.
    pub fn and(&self, other: &CompressedBitmap, nbits: usize) -> Option<CompressedBitmap> {
        let mut bv = self.to_bitvec(nbits);
        bv.and_assign(&other.to_bitvec(nbits));

        if bv.cardinality() > 0 {
            Some(Self::from_bitvec(&bv))
        } else {
            None
        }
    }

    /// Union at `nbits` granularity.
    pub fn or(&self, other: &CompressedBitmap, nbits: usize) -> CompressedBitmap {
        let mut bv = self.to_bitvec(nbits);
        bv.or_assign(&other.to_bitvec(nbits));
        Self::from_bitvec(&bv)
    }

    /// Negation restricted to the declared size.
    pub fn flip(&self, nbits: usize) -> CompressedBitmap {
        let mut bv = self.to_bitvec(nbits);
        bv.flip_all();
        Self::from_bitvec(&bv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv_from_bits(nbits: usize, bits: &[usize]) -> BitVec {
        let mut bv = BitVec::new(nbits);
        for &b in bits {
            bv.set(b);
        }
        bv
    }

    #[test]
    fn test_bitvec_set_get() {
        let mut bv = BitVec::new(200);
        bv.set(0);
        bv.set(63);
        bv.set(64);
        bv.set(199);
        assert!(bv.get(0));
        assert!(bv.get(63));
        assert!(bv.get(64));
        assert!(bv.get(199));
        assert!(!bv.get(1));
        assert_eq!(bv.cardinality(), 4);
    }

    #[test]
    fn test_bitvec_next_set_bit() {
        let bv = bv_from_bits(300, &[5, 70, 299]);
        assert_eq!(bv.next_set_bit(0), Some(5));
        assert_eq!(bv.next_set_bit(5), Some(5));
        assert_eq!(bv.next_set_bit(6), Some(70));
        assert_eq!(bv.next_set_bit(71), Some(299));
        assert_eq!(bv.next_set_bit(300), None);
    }

    #[test]
    fn test_bitvec_clear_range() {
        let mut bv = bv_from_bits(128, &[10, 20, 30, 40]);
        bv.clear_range(15, 35);
        assert!(bv.get(10));
        assert!(!bv.get(20));
        assert!(!bv.get(30));
        assert!(bv.get(40));
    }

    #[test]
    fn test_bitvec_slice() {
        let bv = bv_from_bits(256, &[64, 65, 127]);
        let s = bv.slice(64, 128);
        assert_eq!(s.len(), 64);
        assert!(s.get(0));
        assert!(s.get(1));
        assert!(s.get(63));
        assert_eq!(s.cardinality(), 3);
    }

    #[test]
    fn test_compress_roundtrip() {
        let bv = bv_from_bits(6400, &[0, 1, 6399, 3200]);
        let cb = CompressedBitmap::from_bitvec(&bv);
        assert_eq!(cb.cardinality(), 4);
        assert_eq!(cb.to_bitvec(6400), bv);
    }

    #[test]
    fn test_compress_long_runs() {
        let mut bv = BitVec::new(6400);
        bv.set_range(0, 6400);
        let cb = CompressedBitmap::from_bitvec(&bv);
        // All-one words collapse into a single run.
        assert_eq!(cb.runs.len(), 1);
        assert_eq!(cb.cardinality(), 6400);
        assert_eq!(cb.to_bitvec(6400), bv);
    }

    #[test]
    fn test_and_matches_bitwise() {
        let a = bv_from_bits(512, &[1, 100, 200, 300]);
        let b = bv_from_bits(512, &[100, 300, 400]);
        let ca = CompressedBitmap::from_bitvec(&a);
        let cb = CompressedBitmap::from_bitvec(&b);

        let anded = ca.and(&cb, 512).expect("non-empty intersection");
        let mut expected = a.clone();
        expected.and_assign(&b);
        assert_eq!(anded.to_bitvec(512), expected);

        // Commutative.
        assert_eq!(cb.and(&ca, 512).unwrap().to_bitvec(512), expected);
    }

    #[test]
    fn test_and_empty_is_none() {
        let a = CompressedBitmap::from_bitvec(&bv_from_bits(512, &[1, 2]));
        let b = CompressedBitmap::from_bitvec(&bv_from_bits(512, &[3, 4]));
        assert!(a.and(&b, 512).is_none());
    }

    #[test]
    fn test_or_matches_bitwise() {
        let a = bv_from_bits(512, &[1, 100]);
        let b = bv_from_bits(512, &[100, 400]);
        let ca = CompressedBitmap::from_bitvec(&a);
        let cb = CompressedBitmap::from_bitvec(&b);

        let mut expected = a.clone();
        expected.or_assign(&b);
        assert_eq!(ca.or(&cb, 512).to_bitvec(512), expected);
        assert_eq!(cb.or(&ca, 512).to_bitvec(512), expected);
    }

    #[test]
    fn test_flip_is_not_restricted_to_size() {
        let a = bv_from_bits(100, &[0, 50, 99]);
        let ca = CompressedBitmap::from_bitvec(&a);
        let flipped = ca.flip(100);

        assert_eq!(flipped.cardinality(), 97);
        for bit in 0..100 {
            assert_eq!(flipped.to_bitvec(100).get(bit), !a.get(bit));
        }
        // Double flip restores the original.
        assert_eq!(flipped.flip(100).to_bitvec(100), a);
    }

    #[test]
    fn test_serde_roundtrip() {
        let bv = bv_from_bits(6400, &[7, 800, 6399]);
        let cb = CompressedBitmap::from_bitvec(&bv);
        let bytes = bincode::serde::encode_to_vec(&cb, bincode::config::legacy()).unwrap();
        let (back, _): (CompressedBitmap, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(back, cb);
    }
}
