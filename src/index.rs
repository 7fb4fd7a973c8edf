//! Archive index: binds chunk ids to embeddings, snippets and frame numbers.
//!
//! Ids are assigned contiguously from the engine's item count, so the
//! metadata map and the vector engine always hold the same number of items.
//! The index persists as a JSON document plus a sibling `.vec` file holding
//! the engine's native bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, EmbeddingConfig, IndexConfig, Metric};
use crate::constants::SNIPPET_CHARS;
use crate::embedding::EmbeddingProvider;
use crate::error::{ArchiveError, Result};
use crate::text::snippet;
use crate::util::{vector_path, write_atomic, write_bytes_atomic};
use crate::vec::{FlatVectorEngine, VectorEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: u64,
    pub text_snippet: String,
    pub frame_num: u64,
}

/// A search hit with the engine distance and a similarity score derived
/// from it (higher is closer).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub metadata: ChunkMetadata,
    pub distance: f32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_items: usize,
    pub dimensionality: usize,
    pub metric: Metric,
    pub known_frames: usize,
}

/// Advisory copy of the settings an index was built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentConfig {
    embedding: EmbeddingConfig,
    index: IndexConfig,
}

/// On-disk index document. serde_json writes the integer map keys as strings.
#[derive(Serialize, Deserialize)]
struct IndexDocument {
    metadata: BTreeMap<u64, ChunkMetadata>,
    frame_to_chunks: BTreeMap<u64, Vec<u64>>,
    config: DocumentConfig,
}

pub struct ArchiveIndex {
    config: Config,
    engine: Box<dyn VectorEngine>,
    embedder: Arc<dyn EmbeddingProvider>,
    metadata: BTreeMap<u64, ChunkMetadata>,
    frame_to_ids: BTreeMap<u64, Vec<u64>>,
}

impl fmt::Debug for ArchiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveIndex")
            .field("items", &self.engine.len())
            .field("metric", &self.engine.metric())
            .field("dimension", &self.engine.dimension())
            .field("embedder", &self.embedder.kind())
            .field("frames", &self.frame_to_ids.len())
            .finish()
    }
}

fn check_embedder(config: &Config, embedder: &dyn EmbeddingProvider) -> Result<()> {
    let expected = config.index.embedding_dimensions;
    if embedder.dimension() != expected {
        return Err(ArchiveError::validation(format!(
            "embedding provider '{}' produces {} dimensions, index expects {expected}",
            embedder.model(),
            embedder.dimension()
        )));
    }
    Ok(())
}

impl ArchiveIndex {
    /// Empty index backed by the exact flat engine.
    pub fn create(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let engine = Box::new(FlatVectorEngine::new(&config.index));
        Self::with_engine(config, embedder, engine)
    }

    /// Empty index over a caller-supplied engine.
    pub fn with_engine(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        engine: Box<dyn VectorEngine>,
    ) -> Result<Self> {
        config.validate()?;
        check_embedder(config, embedder.as_ref())?;
        if engine.dimension() != config.index.embedding_dimensions {
            return Err(ArchiveError::DimensionMismatch {
                expected: config.index.embedding_dimensions,
                actual: engine.dimension(),
            });
        }
        if !engine.is_empty() {
            return Err(ArchiveError::index("a new index needs an empty engine"));
        }
        Ok(Self {
            config: config.clone(),
            engine,
            embedder,
            metadata: BTreeMap::new(),
            frame_to_ids: BTreeMap::new(),
        })
    }

    /// Insert chunks paired with their frame numbers.
    ///
    /// Pairs whose chunk is blank after trimming are skipped. Survivors are
    /// embedded in one batch and receive contiguous ids starting at the
    /// current item count; the assigned ids are returned in input order.
    /// On error nothing is inserted.
    pub fn add_items<S: AsRef<str>>(
        &mut self,
        chunks: &[S],
        frame_numbers: &[u64],
    ) -> Result<Vec<u64>> {
        if chunks.len() != frame_numbers.len() {
            tracing::warn!(
                chunks = chunks.len(),
                frames = frame_numbers.len(),
                "chunk and frame counts differ; extra entries ignored"
            );
        }
        let survivors: Vec<(&str, u64)> = chunks
            .iter()
            .map(AsRef::as_ref)
            .zip(frame_numbers.iter().copied())
            .filter(|(chunk, _)| !chunk.trim().is_empty())
            .collect();
        if survivors.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = survivors.iter().map(|(text, _)| *text).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        if embeddings.len() != texts.len() {
            return Err(ArchiveError::index(format!(
                "embedding provider returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }

        let start = self.engine.len() as u64;
        let ids: Vec<u64> = (start..start + survivors.len() as u64).collect();
        self.engine.add(&ids, embeddings)?;

        for (&id, (text, frame_num)) in ids.iter().zip(survivors) {
            self.metadata.insert(
                id,
                ChunkMetadata {
                    id,
                    text_snippet: snippet(text, SNIPPET_CHARS),
                    frame_num,
                },
            );
            self.frame_to_ids.entry(frame_num).or_default().push(id);
        }
        tracing::debug!(added = ids.len(), total = self.engine.len(), "indexed chunks");
        Ok(ids)
    }

    /// Up to `top_k` chunks nearest to `query`, nearest first.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<ChunkMetadata>> {
        Ok(self
            .search_scored(query, top_k)?
            .into_iter()
            .map(|hit| hit.metadata)
            .collect())
    }

    pub fn search_scored(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 || self.engine.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed_text(query)?;
        let hits = self
            .engine
            .search(&embedding, top_k, self.config.index.ef_search)?;
        let metric = self.engine.metric();
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let Some(metadata) = self.metadata.get(&hit.id) else {
                    tracing::warn!(id = hit.id, "engine returned an id without metadata");
                    return None;
                };
                Some(ScoredChunk {
                    metadata: metadata.clone(),
                    distance: hit.distance,
                    score: similarity(metric, hit.distance),
                })
            })
            .take(top_k)
            .collect())
    }

    #[must_use]
    pub fn get_stats(&self) -> IndexStats {
        IndexStats {
            total_items: self.engine.len(),
            dimensionality: self.engine.dimension(),
            metric: self.engine.metric(),
            known_frames: self.frame_to_ids.len(),
        }
    }

    #[must_use]
    pub fn get_chunk_by_id(&self, id: u64) -> Option<&ChunkMetadata> {
        self.metadata.get(&id)
    }

    /// Chunks stored in `frame_num`, in id order.
    #[must_use]
    pub fn get_chunks_by_frame(&self, frame_num: u64) -> Vec<&ChunkMetadata> {
        self.frame_to_ids
            .get(&frame_num)
            .map(|ids| ids.iter().filter_map(|id| self.metadata.get(id)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<u64, ChunkMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn frame_to_ids(&self) -> &BTreeMap<u64, Vec<u64>> {
        &self.frame_to_ids
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write the document to `path` and the engine bytes next to it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let vectors = vector_path(path);
        write_bytes_atomic(&vectors, &self.engine.to_bytes()?)?;

        let document = IndexDocument {
            metadata: self.metadata.clone(),
            frame_to_chunks: self.frame_to_ids.clone(),
            config: DocumentConfig {
                embedding: self.config.embedding.clone(),
                index: self.config.index.clone(),
            },
        };
        write_atomic(path, |file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &document)?;
            writer.flush()?;
            Ok(())
        })?;
        tracing::info!(
            path = %path.display(),
            items = self.metadata.len(),
            frames = self.frame_to_ids.len(),
            "saved archive index"
        );
        Ok(())
    }

    /// Load a saved index into a fresh flat engine sized from `config`.
    ///
    /// The caller's `config` wins over the copy stored in the document.
    pub fn load(config: &Config, embedder: Arc<dyn EmbeddingProvider>, path: &Path) -> Result<Self> {
        let engine = Box::new(FlatVectorEngine::new(&config.index));
        Self::load_with_engine(config, embedder, engine, path)
    }

    pub fn load_with_engine(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        engine: Box<dyn VectorEngine>,
        path: &Path,
    ) -> Result<Self> {
        let mut index = Self::with_engine(config, embedder, engine)?;

        let vectors = vector_path(path);
        let bytes = std::fs::read(&vectors).map_err(|err| ArchiveError::io_at(err, &vectors))?;
        index.engine.load_bytes(&bytes)?;

        let data = std::fs::read(path).map_err(|err| ArchiveError::io_at(err, path))?;
        let document: IndexDocument = serde_json::from_slice(&data)?;
        if document.metadata.len() != index.engine.len() {
            return Err(ArchiveError::index(format!(
                "index document lists {} chunks but the vector file holds {}",
                document.metadata.len(),
                index.engine.len()
            )));
        }
        let expected_ids = 0..index.engine.len() as u64;
        if !document.metadata.keys().copied().eq(expected_ids) {
            return Err(ArchiveError::index(
                "chunk ids must run from 0 without gaps to match the vector file",
            ));
        }
        if let Some((key, entry)) = document.metadata.iter().find(|(key, entry)| **key != entry.id)
        {
            return Err(ArchiveError::index(format!(
                "metadata key {key} does not match chunk id {}",
                entry.id
            )));
        }
        for (frame, ids) in &document.frame_to_chunks {
            if ids.is_empty() || ids.iter().any(|id| !document.metadata.contains_key(id)) {
                return Err(ArchiveError::index(format!(
                    "frame {frame} references unknown chunks"
                )));
            }
        }
        if document.config.index.metric != config.index.metric {
            tracing::debug!(
                stored = %document.config.index.metric,
                configured = %config.index.metric,
                "index metric overridden by configuration"
            );
        }

        index.metadata = document.metadata;
        index.frame_to_ids = document.frame_to_chunks;
        tracing::info!(
            path = %path.display(),
            items = index.metadata.len(),
            "loaded archive index"
        );
        Ok(index)
    }
}

fn similarity(metric: Metric, distance: f32) -> f32 {
    match metric {
        Metric::Cosine => 1.0 - distance,
        Metric::L2 => 1.0 / (1.0 + distance),
        Metric::Ip => -distance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use tempfile::TempDir;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.embedding.dimension = 64;
        config.index.embedding_dimensions = 64;
        config
    }

    fn new_index(config: &Config) -> ArchiveIndex {
        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        ArchiveIndex::create(config, embedder).unwrap()
    }

    #[test]
    fn blank_chunks_are_filtered_and_pairing_kept() {
        let mut index = new_index(&small_config());
        let ids = index
            .add_items(&["valid chunk", "", "  ", "another valid"], &[1, 2, 3, 5])
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(index.len(), 2);
        let frames: Vec<u64> = index.frame_to_ids().keys().copied().collect();
        assert_eq!(frames, vec![1, 5]);
        assert_eq!(index.get_chunk_by_id(1).unwrap().text_snippet, "another valid");
    }

    #[test]
    fn ids_continue_from_item_count() {
        let mut index = new_index(&small_config());
        index.add_items(&["one", "two"], &[0, 1]).unwrap();
        let ids = index.add_items(&["three", "four"], &[1, 2]).unwrap();
        assert_eq!(ids, vec![2, 3]);
        let frame_one: Vec<u64> = index.get_chunks_by_frame(1).iter().map(|c| c.id).collect();
        assert_eq!(frame_one, vec![1, 2]);
        assert!(index.get_chunks_by_frame(42).is_empty());
    }

    #[test]
    fn snippets_are_truncated() {
        let mut index = new_index(&small_config());
        let long = "é".repeat(250);
        index.add_items(&[long.as_str()], &[0]).unwrap();
        assert_eq!(index.get_chunk_by_id(0).unwrap().text_snippet.chars().count(), 100);
    }

    #[test]
    fn search_ranks_by_similarity() {
        let mut index = new_index(&Config::default());
        index
            .add_items(&["apple", "apricot", "banana"], &[1, 2, 3])
            .unwrap();
        let hits = index.search("apply", 2).unwrap();
        assert_eq!(hits.len(), 2);
        let texts: Vec<&str> = hits.iter().map(|c| c.text_snippet.as_str()).collect();
        assert!(texts.contains(&"apple"));
        assert!(!texts.contains(&"banana"));

        let scored = index.search_scored("apply", 3).unwrap();
        assert!(scored.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(scored[0].score >= scored[1].score);
    }

    #[test]
    fn capacity_error_leaves_index_unchanged() {
        let mut config = small_config();
        config.index.max_elements = 2;
        let mut index = new_index(&config);
        index.add_items(&["a1"], &[0]).unwrap();
        let err = index.add_items(&["b2", "c3"], &[1, 2]).unwrap_err();
        assert!(matches!(err, ArchiveError::CapacityExceeded { .. }));
        assert_eq!(index.len(), 1);
        assert_eq!(index.metadata().len(), 1);
    }

    #[test]
    fn mismatched_embedder_is_rejected() {
        let config = small_config();
        let embedder = Arc::new(HashingEmbedder::new(&EmbeddingConfig {
            dimension: 32,
            ..EmbeddingConfig::default()
        }));
        assert!(ArchiveIndex::create(&config, embedder).is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let config = small_config();
        let mut index = new_index(&config);
        index
            .add_items(&["red fox", "blue whale", "green frog"], &[0, 1, 1])
            .unwrap();
        index.save(&path).unwrap();
        assert!(dir.path().join("archive.vec").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw["metadata"]["0"].is_object());
        assert_eq!(raw["frame_to_chunks"]["1"], serde_json::json!([1, 2]));

        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        let loaded = ArchiveIndex::load(&config, embedder, &path).unwrap();
        assert_eq!(loaded.metadata(), index.metadata());
        assert_eq!(loaded.frame_to_ids(), index.frame_to_ids());
        assert_eq!(loaded.search("blue whale", 1).unwrap()[0].text_snippet, "blue whale");
    }

    #[test]
    fn load_uses_caller_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let config = small_config();
        let mut index = new_index(&config);
        index.add_items(&["alpha"], &[0]).unwrap();
        index.save(&path).unwrap();

        let mut other = config.clone();
        other.index.ef_search = 7;
        other.index.metric = Metric::L2;
        let embedder = Arc::new(HashingEmbedder::new(&other.embedding));
        let loaded = ArchiveIndex::load(&other, embedder, &path).unwrap();
        assert_eq!(loaded.config().index.ef_search, 7);
        assert_eq!(loaded.get_stats().metric, Metric::L2);
    }

    #[test]
    fn load_rejects_dimension_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let mut index = new_index(&small_config());
        index.add_items(&["alpha"], &[0]).unwrap();
        index.save(&path).unwrap();

        let config = Config::default();
        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        assert!(ArchiveIndex::load(&config, embedder, &path).is_err());
    }

    #[test]
    fn load_rejects_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let config = small_config();
        let mut index = new_index(&config);
        index.add_items(&["alpha", "beta"], &[0, 1]).unwrap();
        index.save(&path).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["metadata"].as_object_mut().unwrap().remove("1");
        raw["frame_to_chunks"].as_object_mut().unwrap().remove("1");
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        let err = ArchiveIndex::load(&config, embedder, &path).unwrap_err();
        assert!(matches!(err, ArchiveError::Index { .. }));
    }

    #[test]
    fn load_rejects_ids_outside_vector_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let config = small_config();
        let mut index = new_index(&config);
        index.add_items(&["alpha", "beta"], &[0, 1]).unwrap();
        index.save(&path).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let metadata = raw["metadata"].as_object_mut().unwrap();
        let mut moved = metadata.remove("1").unwrap();
        moved["id"] = serde_json::json!(5);
        metadata.insert("5".to_string(), moved);
        raw["frame_to_chunks"]["1"] = serde_json::json!([5]);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        let err = ArchiveIndex::load(&config, embedder, &path).unwrap_err();
        assert!(err.to_string().contains("without gaps"));
    }
}
