//! Per-tenant vector index.
//!
//! A flat inner-product index over unit vectors: append-only slots, logical
//! deletion via tombstones, and compaction once tombstones exceed a quarter
//! of the slots. Search is exact (no ANN structure); tenants are small
//! enough that a scan over resident vectors beats maintaining cluster state.
//!
//! Persistence is a pair of artifacts written through temp-file + rename:
//! the vector blob (`index.bin`, checksummed) and the sidecar slot→chunk
//! map (`slots.map`). Slot ids are stable between compactions; compaction
//! returns the old→new remap so chunk rows can be rewritten in the same
//! transaction that publishes the new layout.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const BLOB_MAGIC: &[u8; 4] = b"RGLI";
const BLOB_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

/// Tombstone fraction beyond which [`TenantIndex::needs_compaction`] fires.
pub const COMPACTION_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Live(String),
    Tombstone,
}

#[derive(Debug, Clone)]
pub struct TenantIndex {
    dims: usize,
    /// Flattened vectors, one `dims`-wide row per slot (tombstones keep
    /// their row so slot ids stay positional).
    vectors: Vec<f32>,
    slots: Vec<Slot>,
    tombstones: usize,
}

impl TenantIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: Vec::new(),
            slots: Vec::new(),
            tombstones: 0,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of live (searchable) vectors.
    pub fn live_len(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.live_len() == 0
    }

    pub fn chunk_id(&self, slot: i64) -> Option<&str> {
        match self.slots.get(slot as usize) {
            Some(Slot::Live(id)) => Some(id),
            _ => None,
        }
    }

    /// Append vectors, assigning contiguous slots. Returns the slots in
    /// input order.
    pub fn upsert(&mut self, chunk_ids: &[String], vectors: &[Vec<f32>]) -> Result<Vec<i64>> {
        if chunk_ids.len() != vectors.len() {
            return Err(Error::Storage(
                "chunk_ids and vectors must have the same length".into(),
            ));
        }
        let mut assigned = Vec::with_capacity(chunk_ids.len());
        for (chunk_id, vector) in chunk_ids.iter().zip(vectors) {
            if vector.len() != self.dims {
                return Err(Error::Storage(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dims
                )));
            }
            assigned.push(self.slots.len() as i64);
            self.slots.push(Slot::Live(chunk_id.clone()));
            self.vectors.extend_from_slice(vector);
        }
        Ok(assigned)
    }

    /// Top-k by dot product over live slots; ties break toward the smaller
    /// slot id.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if query.len() != self.dims || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(i64, f32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(i, _)| {
                let row = &self.vectors[i * self.dims..(i + 1) * self.dims];
                let score: f32 = row.iter().zip(query).map(|(a, b)| a * b).sum();
                (i as i64, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Logically delete slots. Unknown and already-dead slots are ignored.
    pub fn remove(&mut self, slots: &[i64]) -> usize {
        let mut removed = 0;
        for &slot in slots {
            if let Some(entry) = self.slots.get_mut(slot as usize) {
                if matches!(entry, Slot::Live(_)) {
                    *entry = Slot::Tombstone;
                    removed += 1;
                }
            }
        }
        self.tombstones += removed;
        removed
    }

    pub fn needs_compaction(&self) -> bool {
        !self.slots.is_empty()
            && (self.tombstones as f64 / self.slots.len() as f64) > COMPACTION_THRESHOLD
    }

    /// Rewrite the index without tombstones. Returns `(old_slot, new_slot)`
    /// for every surviving vector; the caller must rewrite chunk rows with
    /// the new slots before publishing.
    pub fn compact(&mut self) -> Vec<(i64, i64)> {
        let mut remap = Vec::with_capacity(self.live_len());
        let mut vectors = Vec::with_capacity(self.live_len() * self.dims);
        let mut slots = Vec::with_capacity(self.live_len());

        for (old, slot) in self.slots.iter().enumerate() {
            if let Slot::Live(chunk_id) = slot {
                let new = slots.len() as i64;
                remap.push((old as i64, new));
                vectors.extend_from_slice(&self.vectors[old * self.dims..(old + 1) * self.dims]);
                slots.push(Slot::Live(chunk_id.clone()));
            }
        }

        self.vectors = vectors;
        self.slots = slots;
        self.tombstones = 0;
        remap
    }

    /// Serialize to `(blob, sidecar)`.
    ///
    /// Blob layout: magic, version, dims, slot count, then one flag byte +
    /// row per slot, then a SHA-256 over everything preceding it. The
    /// sidecar is the JSON list of `[slot, chunk_id]` pairs for live slots.
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        let mut blob = Vec::with_capacity(16 + self.slots.len() * (1 + self.dims * 4));
        blob.extend_from_slice(BLOB_MAGIC);
        blob.extend_from_slice(&BLOB_VERSION.to_le_bytes());
        blob.extend_from_slice(&(self.dims as u32).to_le_bytes());
        blob.extend_from_slice(&(self.slots.len() as u64).to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            blob.push(matches!(slot, Slot::Live(_)) as u8);
            for value in &self.vectors[i * self.dims..(i + 1) * self.dims] {
                blob.extend_from_slice(&value.to_le_bytes());
            }
        }
        let checksum = Sha256::digest(&blob);
        blob.extend_from_slice(&checksum);

        let mapping: Vec<(i64, &str)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Live(id) => Some((i as i64, id.as_str())),
                Slot::Tombstone => None,
            })
            .collect();
        let sidecar = serde_json::to_vec(&mapping).expect("slot map serializes");

        (blob, sidecar)
    }

    /// Deserialize from a blob + sidecar pair.
    ///
    /// A checksum or structure mismatch is reported as [`Error::Unavailable`];
    /// the caller quarantines the tenant's index rather than rebuilding
    /// silently.
    pub fn decode(blob: &[u8], sidecar: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| Error::Unavailable(format!("index blob corrupt: {}", msg));

        if blob.len() < 20 + CHECKSUM_LEN {
            return Err(corrupt("truncated"));
        }
        let (payload, checksum) = blob.split_at(blob.len() - CHECKSUM_LEN);
        let expected = Sha256::digest(payload);
        if expected.as_slice() != checksum {
            return Err(corrupt("checksum mismatch"));
        }
        if &payload[0..4] != BLOB_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        if version != BLOB_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let dims = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
        let count = u64::from_le_bytes(payload[12..20].try_into().unwrap()) as usize;

        let row_len = 1 + dims * 4;
        if payload.len() != 20 + count * row_len {
            return Err(corrupt("length mismatch"));
        }

        let mapping: Vec<(i64, String)> =
            serde_json::from_slice(sidecar).map_err(|_| corrupt("sidecar unreadable"))?;
        let by_slot: std::collections::HashMap<i64, String> = mapping.into_iter().collect();

        let mut vectors = Vec::with_capacity(count * dims);
        let mut slots = Vec::with_capacity(count);
        let mut tombstones = 0;

        for i in 0..count {
            let row = &payload[20 + i * row_len..20 + (i + 1) * row_len];
            let live = row[0] == 1;
            for chunk in row[1..].chunks_exact(4) {
                vectors.push(f32::from_le_bytes(chunk.try_into().unwrap()));
            }
            if live {
                match by_slot.get(&(i as i64)) {
                    Some(chunk_id) => slots.push(Slot::Live(chunk_id.clone())),
                    None => return Err(corrupt("live slot missing from sidecar")),
                }
            } else {
                slots.push(Slot::Tombstone);
                tombstones += 1;
            }
        }

        Ok(Self {
            dims,
            vectors,
            slots,
            tombstones,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chunk-{}", i)).collect()
    }

    #[test]
    fn upsert_assigns_contiguous_slots() {
        let mut index = TenantIndex::new(4);
        let slots = index
            .upsert(&ids(3), &[unit(4, 0), unit(4, 1), unit(4, 2)])
            .unwrap();
        assert_eq!(slots, vec![0, 1, 2]);
        let more = index.upsert(&ids(1), &[unit(4, 3)]).unwrap();
        assert_eq!(more, vec![3]);
        assert_eq!(index.live_len(), 4);
    }

    #[test]
    fn search_orders_by_score_then_slot() {
        let mut index = TenantIndex::new(2);
        // Slots 0 and 2 hold the same vector; 1 holds an orthogonal one.
        index
            .upsert(
                &ids(3),
                &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]],
            )
            .unwrap();
        let results = index.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].0, 0, "tie must break toward the smaller slot");
        assert_eq!(results[1].0, 2);
        assert_eq!(results[2].0, 1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = TenantIndex::new(4);
        assert!(index.upsert(&ids(1), &[vec![1.0, 0.0]]).is_err());
        assert!(index.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn removed_slots_are_skipped() {
        let mut index = TenantIndex::new(2);
        index
            .upsert(&ids(2), &[vec![1.0, 0.0], vec![0.9, 0.1]])
            .unwrap();
        assert_eq!(index.remove(&[0]), 1);
        assert_eq!(index.remove(&[0, 7]), 0);
        let results = index.search(&[1.0, 0.0], 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
        assert_eq!(index.chunk_id(0), None);
    }

    #[test]
    fn compaction_threshold() {
        let mut index = TenantIndex::new(2);
        index
            .upsert(&ids(4), &(0..4).map(|_| vec![1.0, 0.0]).collect::<Vec<_>>())
            .unwrap();
        index.remove(&[0]);
        assert!(!index.needs_compaction(), "1/4 is not above the threshold");
        index.remove(&[1]);
        assert!(index.needs_compaction());
    }

    #[test]
    fn compaction_remaps_and_preserves_results() {
        let mut index = TenantIndex::new(2);
        index
            .upsert(
                &ids(4),
                &[
                    vec![1.0, 0.0],
                    vec![0.6, 0.8],
                    vec![0.0, 1.0],
                    vec![0.8, 0.6],
                ],
            )
            .unwrap();
        index.remove(&[1]);

        let query = [1.0f32, 0.0];
        let before: Vec<String> = index
            .search(&query, 3)
            .iter()
            .map(|(s, _)| index.chunk_id(*s).unwrap().to_string())
            .collect();

        let remap = index.compact();
        assert_eq!(remap, vec![(0, 0), (2, 1), (3, 2)]);
        assert_eq!(index.tombstone_count(), 0);

        let after: Vec<String> = index
            .search(&query, 3)
            .iter()
            .map(|(s, _)| index.chunk_id(*s).unwrap().to_string())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn codec_roundtrip_with_tombstones() {
        let mut index = TenantIndex::new(3);
        index
            .upsert(&ids(3), &[unit(3, 0), unit(3, 1), unit(3, 2)])
            .unwrap();
        index.remove(&[1]);

        let (blob, sidecar) = index.encode();
        let decoded = TenantIndex::decode(&blob, &sidecar).unwrap();
        assert_eq!(decoded.live_len(), 2);
        assert_eq!(decoded.tombstone_count(), 1);
        assert_eq!(decoded.chunk_id(0), Some("chunk-0"));
        assert_eq!(decoded.chunk_id(1), None);
        assert_eq!(decoded.search(&unit(3, 2), 1)[0].0, 2);
    }

    #[test]
    fn checksum_corruption_is_unavailable() {
        let mut index = TenantIndex::new(2);
        index.upsert(&ids(1), &[vec![1.0, 0.0]]).unwrap();
        let (mut blob, sidecar) = index.encode();
        let mid = blob.len() / 2;
        blob[mid] ^= 0xff;
        let err = TenantIndex::decode(&blob, &sidecar).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn sidecar_mismatch_is_unavailable() {
        let mut index = TenantIndex::new(2);
        index.upsert(&ids(2), &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let (blob, _) = index.encode();
        let err = TenantIndex::decode(&blob, b"[[0,\"only-one\"]]").unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
