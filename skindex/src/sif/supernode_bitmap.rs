//! The per-(term, super node) bitmap bundle stored in the bitmap store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bitmap::{BitVec, CompressedBitmap};

/// Compressed presence bitmaps for one term at one super node: one bitmap
/// per field the term occurs in, plus a merged "any field" bitmap when the
/// term spans several fields.
///
/// Fields whose bitmaps are identical share one stored copy. Immutable once
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperNodeBitmap {
    /// Distinct bitmaps; `fields` indexes into this.
    bitmaps: Vec<CompressedBitmap>,
    fields: HashMap<u16, u32>,
    /// Merged across fields; `None` when only one distinct bitmap exists
    /// (the merge would equal it).
    any_field: Option<CompressedBitmap>,
}

impl SuperNodeBitmap {
    pub fn new(field_bitmaps: &HashMap<u16, BitVec>) -> Self {
        let mut bitmaps: Vec<CompressedBitmap> = Vec::new();
        let mut fields: HashMap<u16, u32> = HashMap::new();
        let mut merged: Option<BitVec> = None;

        let mut field_ids: Vec<u16> = field_bitmaps.keys().copied().collect();
        field_ids.sort_unstable();

        for field in field_ids {
            let bv = &field_bitmaps[&field];
            let compressed = CompressedBitmap::from_bitvec(bv);

            let index = match bitmaps.iter().position(|b| *b == compressed) {
                Some(i) => i as u32,
                None => {
                    bitmaps.push(compressed);
                    (bitmaps.len() - 1) as u32
                }
            };
            fields.insert(field, index);

            match merged.as_mut() {
                Some(m) => m.or_assign(bv),
                None => merged = Some(bv.clone()),
            }
        }

        let any_field = if bitmaps.len() > 1 {
            merged.map(|m| CompressedBitmap::from_bitvec(&m))
        } else {
            None
        };

        Self {
            bitmaps,
            fields,
            any_field,
        }
    }

    /// Bitmap for one field, if the term occurs in it here.
    pub fn field_bitmap(&self, field: u16) -> Option<&CompressedBitmap> {
        self.fields
            .get(&field)
            .map(|&i| &self.bitmaps[i as usize])
    }

    /// Bitmap merged across all fields.
    pub fn any_field(&self) -> Option<&CompressedBitmap> {
        match &self.any_field {
            Some(merged) => Some(merged),
            None => self.bitmaps.first(),
        }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of distinct stored bitmaps (deduplicated).
    pub fn distinct_bitmap_count(&self) -> usize {
        self.bitmaps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(bits: &[usize]) -> BitVec {
        let mut v = BitVec::new(256);
        for &b in bits {
            v.set(b);
        }
        v
    }

    #[test]
    fn test_single_field() {
        let mut fields = HashMap::new();
        fields.insert(2u16, bv(&[1, 5]));
        let bundle = SuperNodeBitmap::new(&fields);

        assert_eq!(bundle.field_count(), 1);
        assert_eq!(bundle.field_bitmap(2).unwrap().cardinality(), 2);
        assert!(bundle.field_bitmap(0).is_none());
        // Any-field falls back to the single field's bitmap.
        assert_eq!(bundle.any_field(), bundle.field_bitmap(2));
    }

    #[test]
    fn test_identical_field_bitmaps_share_storage() {
        let mut fields = HashMap::new();
        fields.insert(0u16, bv(&[3, 9]));
        fields.insert(4u16, bv(&[3, 9]));
        let bundle = SuperNodeBitmap::new(&fields);

        assert_eq!(bundle.field_count(), 2);
        assert_eq!(bundle.distinct_bitmap_count(), 1);
        assert_eq!(bundle.field_bitmap(0), bundle.field_bitmap(4));
        // One distinct bitmap: merged copy is elided.
        assert_eq!(bundle.any_field().unwrap().cardinality(), 2);
    }

    #[test]
    fn test_any_field_merges_distinct_fields() {
        let mut fields = HashMap::new();
        fields.insert(0u16, bv(&[1]));
        fields.insert(1u16, bv(&[100, 200]));
        let bundle = SuperNodeBitmap::new(&fields);

        assert_eq!(bundle.distinct_bitmap_count(), 2);
        let any = bundle.any_field().unwrap().to_bitvec(256);
        assert!(any.get(1));
        assert!(any.get(100));
        assert!(any.get(200));
        assert_eq!(any.cardinality(), 3);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut fields = HashMap::new();
        fields.insert(0u16, bv(&[1, 2]));
        fields.insert(3u16, bv(&[7]));
        let bundle = SuperNodeBitmap::new(&fields);

        let bytes = bincode::serde::encode_to_vec(&bundle, bincode::config::legacy()).unwrap();
        let (back, _): (SuperNodeBitmap, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(back, bundle);
    }
}
