//! Vector engine seam and the exact (flat) engine shipped with the crate.

use blake3::hash;
use serde::{Deserialize, Serialize};

use crate::config::{IndexConfig, Metric};
use crate::constants::{MAX_ARTIFACT_BYTES, VECTOR_MAGIC};
use crate::error::{ArchiveError, Result};
use crate::simd;

fn vec_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

fn vec_decode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
        .with_limit::<MAX_ARTIFACT_BYTES>()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VecSearchHit {
    pub id: u64,
    pub distance: f32,
}

/// Nearest-neighbour engine owned by an archive index.
///
/// Implementations must keep ids and vectors aligned: after a successful
/// `add`, `len` grows by exactly `ids.len()`, and a failed `add` leaves the
/// engine untouched.
pub trait VectorEngine: Send + Sync {
    fn metric(&self) -> Metric;

    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&mut self, ids: &[u64], vectors: Vec<Vec<f32>>) -> Result<()>;

    /// Up to `k` hits, nearest first. `ef_search` is the search breadth for
    /// approximate engines.
    fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<VecSearchHit>>;

    /// Native serialization, written next to the index document.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Replace the engine contents with a previously serialized engine.
    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VecDocument {
    pub id: u64,
    pub embedding: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct FlatSnapshot {
    metric: Metric,
    dimension: u32,
    documents: Vec<VecDocument>,
}

/// Exact k-NN over every stored vector.
#[derive(Debug, Clone)]
pub struct FlatVectorEngine {
    metric: Metric,
    dimension: usize,
    max_elements: usize,
    documents: Vec<VecDocument>,
}

impl FlatVectorEngine {
    #[must_use]
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            metric: config.metric,
            dimension: config.embedding_dimensions,
            max_elements: config.max_elements,
            documents: Vec::new(),
        }
    }

    #[must_use]
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            Metric::Cosine => simd::cosine_distance(a, b),
            Metric::L2 => simd::l2(a, b),
            Metric::Ip => -simd::dot(a, b),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(ArchiveError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

impl VectorEngine for FlatVectorEngine {
    fn metric(&self) -> Metric {
        self.metric
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.documents.len()
    }

    fn add(&mut self, ids: &[u64], vectors: Vec<Vec<f32>>) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(ArchiveError::index(format!(
                "{} ids supplied for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        let requested = self.documents.len() + ids.len();
        if requested > self.max_elements {
            return Err(ArchiveError::CapacityExceeded {
                max_elements: self.max_elements,
                requested,
            });
        }
        for vector in &vectors {
            self.check_dimension(vector.len())?;
        }
        self.documents.extend(
            ids.iter()
                .zip(vectors)
                .map(|(&id, embedding)| VecDocument { id, embedding }),
        );
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, _ef_search: usize) -> Result<Vec<VecSearchHit>> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut hits: Vec<VecSearchHit> = self
            .documents
            .iter()
            .map(|doc| VecSearchHit {
                id: doc.id,
                distance: self.distance(query, &doc.embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let snapshot = FlatSnapshot {
            metric: self.metric,
            dimension: u32::try_from(self.dimension)
                .map_err(|_| ArchiveError::index("dimension does not fit in u32"))?,
            documents: self.documents.clone(),
        };
        let payload = bincode::serde::encode_to_vec(&snapshot, vec_config())?;
        let checksum = hash(&payload);

        let mut bytes = Vec::with_capacity(VECTOR_MAGIC.len() + 32 + payload.len());
        bytes.extend_from_slice(&VECTOR_MAGIC);
        bytes.extend_from_slice(checksum.as_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let header_len = VECTOR_MAGIC.len() + 32;
        if bytes.len() < header_len || bytes[..VECTOR_MAGIC.len()] != VECTOR_MAGIC {
            return Err(ArchiveError::index("vector file has an unknown format"));
        }
        let (checksum, payload) = bytes[VECTOR_MAGIC.len()..].split_at(32);
        if hash(payload).as_bytes() != checksum {
            return Err(ArchiveError::index("vector file checksum mismatch"));
        }

        let (snapshot, read): (FlatSnapshot, usize) =
            bincode::serde::decode_from_slice(payload, vec_decode_config())?;
        if read != payload.len() {
            return Err(ArchiveError::index("trailing bytes after vector snapshot"));
        }
        self.check_dimension(snapshot.dimension as usize)?;
        if snapshot.documents.len() > self.max_elements {
            return Err(ArchiveError::CapacityExceeded {
                max_elements: self.max_elements,
                requested: snapshot.documents.len(),
            });
        }
        if snapshot.metric != self.metric {
            tracing::debug!(
                stored = %snapshot.metric,
                configured = %self.metric,
                "vector file metric differs from configuration; using configured metric"
            );
        }
        self.documents = snapshot.documents;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(metric: Metric, dimension: usize, max_elements: usize) -> FlatVectorEngine {
        FlatVectorEngine::new(&IndexConfig {
            metric,
            embedding_dimensions: dimension,
            max_elements,
            ..IndexConfig::default()
        })
    }

    #[test]
    fn search_orders_nearest_first() {
        let mut engine = engine(Metric::L2, 2, 10);
        engine
            .add(&[0, 1, 2], vec![vec![0.0, 0.0], vec![5.0, 5.0], vec![1.0, 1.0]])
            .unwrap();

        let hits = engine.search(&[0.9, 0.9], 2, 50).unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 0]);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn inner_product_prefers_larger_dot() {
        let mut engine = engine(Metric::Ip, 2, 10);
        engine
            .add(&[7, 8], vec![vec![1.0, 0.0], vec![3.0, 0.0]])
            .unwrap();
        let hits = engine.search(&[1.0, 0.0], 1, 50).unwrap();
        assert_eq!(hits[0].id, 8);
    }

    #[test]
    fn failed_add_leaves_engine_untouched() {
        let mut engine = engine(Metric::Cosine, 3, 2);
        let err = engine
            .add(&[0, 1], vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::DimensionMismatch { .. }));
        assert_eq!(engine.len(), 0);

        let err = engine
            .add(&[0, 1, 2], vec![vec![1.0, 0.0, 0.0]; 3])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::CapacityExceeded { .. }));
        assert!(engine.is_empty());
    }

    #[test]
    fn bytes_roundtrip() {
        let mut original = engine(Metric::Cosine, 3, 10);
        original
            .add(&[0, 1], vec![vec![0.0, 1.0, 2.0], vec![1.0, 2.0, 3.0]])
            .unwrap();
        let bytes = original.to_bytes().unwrap();

        let mut restored = engine(Metric::Cosine, 3, 10);
        restored.load_bytes(&bytes).unwrap();
        assert_eq!(restored.len(), 2);
        let hits = restored.search(&[0.0, 1.0, 2.0], 1, 50).unwrap();
        assert_eq!(hits[0].id, 0);
    }

    #[test]
    fn corrupt_bytes_are_rejected() {
        let mut original = engine(Metric::Cosine, 3, 10);
        original.add(&[0], vec![vec![0.0, 1.0, 2.0]]).unwrap();
        let mut bytes = original.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut restored = engine(Metric::Cosine, 3, 10);
        let err = restored.load_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn loading_into_wrong_dimension_fails() {
        let mut original = engine(Metric::Cosine, 3, 10);
        original.add(&[0], vec![vec![0.0, 1.0, 2.0]]).unwrap();
        let bytes = original.to_bytes().unwrap();

        let mut restored = engine(Metric::Cosine, 4, 10);
        assert!(matches!(
            restored.load_bytes(&bytes),
            Err(ArchiveError::DimensionMismatch { .. })
        ));
    }
}
