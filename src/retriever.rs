//! Retrieval sessions: semantic search over an archive, with hit texts read
//! back from the media file and cached per frame.
//!
//! A cache miss costs one pass over the media in stored order; the pass
//! stops as soon as every missing frame has been handed to the decode pool.
//! The cache is never invalidated because the media is treated as immutable
//! for the lifetime of a session.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use image::RgbImage;

use crate::config::{Config, SymbolSettings};
use crate::error::Result;
use crate::index::{ArchiveIndex, ChunkMetadata};
use crate::registry::Capabilities;
use crate::symbol::SymbolCodec;
use crate::types::{ChunkRecord, RetrieverStats, SearchHit};

pub struct RetrieverSession {
    media_path: PathBuf,
    index: ArchiveIndex,
    caps: Capabilities,
    decode_workers: usize,
    symbol_settings: SymbolSettings,
    /// Raw decoded payload per frame.
    cache: HashMap<u64, String>,
    media_scans: u64,
    frames_decoded: u64,
    decode_failures: u64,
}

impl std::fmt::Debug for RetrieverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieverSession")
            .field("media_path", &self.media_path)
            .field("index", &self.index)
            .field("cached_frames", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl RetrieverSession {
    /// Open a session with the default collaborators for `config`.
    pub fn open(media_path: impl AsRef<Path>, index_path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        config.validate()?;
        let caps = Capabilities::from_config(config)?;
        Self::open_with(media_path, index_path, config, caps)
    }

    pub fn open_with(
        media_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        config: &Config,
        caps: Capabilities,
    ) -> Result<Self> {
        let media_path = media_path.as_ref().to_path_buf();
        let index = ArchiveIndex::load(config, Arc::clone(&caps.embedder), index_path.as_ref())?;
        if !media_path.exists() {
            tracing::warn!(
                path = %media_path.display(),
                "media file not found; results will use index snippets"
            );
        }
        Ok(Self {
            media_path,
            index,
            caps,
            decode_workers: config.decode_workers(),
            symbol_settings: config.symbol.clone(),
            cache: HashMap::new(),
            media_scans: 0,
            frames_decoded: 0,
            decode_failures: 0,
        })
    }

    #[must_use]
    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Texts of the `top_k` best hits, in rank order.
    pub fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .search_with_metadata(query, top_k)?
            .into_iter()
            .map(|hit| hit.text)
            .collect())
    }

    pub fn search_with_metadata(&mut self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let hits = self.index.search_scored(query, top_k)?;
        let frames: BTreeSet<u64> = hits.iter().map(|hit| hit.metadata.frame_num).collect();
        let decoded = self.resolve_frames(&frames);
        Ok(hits
            .into_iter()
            .map(|hit| SearchHit {
                text: text_for(&hit.metadata, &decoded),
                score: hit.score,
                distance: hit.distance,
                chunk_id: hit.metadata.id,
                frame: hit.metadata.frame_num,
            })
            .collect())
    }

    /// Full text of a chunk, or `None` for an unknown id.
    pub fn get_chunk_by_id(&mut self, id: u64) -> Option<String> {
        let metadata = self.index.get_chunk_by_id(id)?.clone();
        let decoded = self.resolve_frames(&BTreeSet::from([metadata.frame_num]));
        Some(text_for(&metadata, &decoded))
    }

    /// Texts of the chunks within `window` ids of `chunk_id`, in id order.
    pub fn get_context_window(&mut self, chunk_id: u64, window: u64) -> Vec<String> {
        let first = chunk_id.saturating_sub(window);
        let last = chunk_id.saturating_add(window);
        let chunks: Vec<ChunkMetadata> = self
            .index
            .metadata()
            .range(first..=last)
            .map(|(_, metadata)| metadata.clone())
            .collect();
        let frames: BTreeSet<u64> = chunks.iter().map(|c| c.frame_num).collect();
        let decoded = self.resolve_frames(&frames);
        chunks.iter().map(|c| text_for(c, &decoded)).collect()
    }

    /// Decode `frames` into the cache ahead of time. Returns how many of
    /// them are cached afterwards.
    pub fn prefetch_frames(&mut self, frames: &[u64]) -> usize {
        let frames: BTreeSet<u64> = frames.iter().copied().collect();
        self.resolve_frames(&frames).len()
    }

    #[must_use]
    pub fn stats(&self) -> RetrieverStats {
        RetrieverStats {
            cache_size: self.cache.len(),
            media_scans: self.media_scans,
            frames_decoded: self.frames_decoded,
            decode_failures: self.decode_failures,
            index: self.index.get_stats(),
        }
    }

    /// Decoded payloads for `frames`, from the cache where possible. Frames
    /// that could not be decoded are absent from the result.
    fn resolve_frames(&mut self, frames: &BTreeSet<u64>) -> HashMap<u64, String> {
        let missing: BTreeSet<u64> = frames
            .iter()
            .copied()
            .filter(|frame| !self.cache.contains_key(frame))
            .collect();
        if !missing.is_empty() {
            let decoded = self.decode_frames(missing);
            self.cache.extend(decoded);
        }
        frames
            .iter()
            .filter_map(|frame| self.cache.get(frame).map(|text| (*frame, text.clone())))
            .collect()
    }

    fn decode_frames(&mut self, missing: BTreeSet<u64>) -> HashMap<u64, String> {
        self.media_scans += 1;
        let requested = missing.len();
        let frames = match self.caps.frames.frames(&self.media_path) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(
                    path = %self.media_path.display(),
                    error = %err,
                    "cannot read media; falling back to snippets"
                );
                self.decode_failures += requested as u64;
                return HashMap::new();
            }
        };

        let pool = FrameDecodePool::new(
            self.decode_workers.min(requested),
            Arc::clone(&self.caps.symbol),
            self.symbol_settings.clone(),
        );
        let decoded = pool.execute(frames, missing);
        self.frames_decoded += decoded.len() as u64;
        self.decode_failures += (requested - decoded.len()) as u64;
        tracing::debug!(
            requested,
            decoded = decoded.len(),
            cached = self.cache.len(),
            "resolved frames from media"
        );
        decoded
    }
}

/// The chunk's text from its decoded frame record, or its stored snippet.
fn text_for(metadata: &ChunkMetadata, decoded: &HashMap<u64, String>) -> String {
    decoded
        .get(&metadata.frame_num)
        .and_then(|raw| serde_json::from_str::<ChunkRecord>(raw).ok())
        .filter(|record| record.frame == metadata.frame_num)
        .map(|record| record.text)
        .unwrap_or_else(|| metadata.text_snippet.clone())
}

struct DecodeJob {
    frame: u64,
    image: RgbImage,
}

type DecodeOutcome = (u64, std::result::Result<String, String>);

/// Fans symbol decoding for a set of frames across worker threads.
struct FrameDecodePool {
    threads: usize,
    symbol: Arc<dyn SymbolCodec>,
    settings: SymbolSettings,
}

impl FrameDecodePool {
    fn new(threads: usize, symbol: Arc<dyn SymbolCodec>, settings: SymbolSettings) -> Self {
        Self {
            threads: threads.max(1),
            symbol,
            settings,
        }
    }

    /// Scan `frames` once and decode every frame listed in `wanted`.
    /// Completion order is irrelevant; results are keyed by frame number.
    fn execute(
        &self,
        frames: crate::frame::FrameStream,
        mut wanted: BTreeSet<u64>,
    ) -> HashMap<u64, String> {
        let (job_tx, job_rx) = bounded::<DecodeJob>(self.threads * 2);
        let (result_tx, result_rx) = unbounded::<DecodeOutcome>();

        let mut handles = Vec::with_capacity(self.threads);
        for worker_id in 0..self.threads {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            let symbol = Arc::clone(&self.symbol);
            let settings = self.settings.clone();
            handles.push(thread::spawn(move || {
                decode_loop(worker_id, &rx, &tx, symbol.as_ref(), &settings);
            }));
        }
        drop(job_rx);
        drop(result_tx);

        for item in frames {
            if wanted.is_empty() {
                break;
            }
            match item {
                Ok(frame) => {
                    if !wanted.remove(&frame.index) {
                        continue;
                    }
                    let job = DecodeJob {
                        frame: frame.index,
                        image: frame.image,
                    };
                    if job_tx.send(job).is_err() {
                        tracing::warn!("decode workers exited early");
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "media scan stopped on a corrupt packet");
                    break;
                }
            }
        }
        if !wanted.is_empty() {
            tracing::debug!(missing = wanted.len(), "frames not present in media");
        }
        drop(job_tx);

        let mut decoded = HashMap::new();
        for (frame, outcome) in result_rx {
            match outcome {
                Ok(text) => {
                    decoded.insert(frame, text);
                }
                Err(reason) => tracing::debug!(frame, %reason, "frame decode failed"),
            }
        }

        for handle in handles {
            if let Err(panic) = handle.join() {
                tracing::warn!(panic = %panic_payload(&panic), "frame decode worker panicked");
            }
        }
        decoded
    }
}

fn decode_loop(
    worker_id: usize,
    jobs: &Receiver<DecodeJob>,
    results: &Sender<DecodeOutcome>,
    symbol: &dyn SymbolCodec,
    settings: &SymbolSettings,
) {
    for job in jobs {
        let outcome = symbol
            .decode(&job.image, settings)
            .map_err(|err| err.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|err| err.to_string()));
        tracing::trace!(worker_id, frame = job.frame, ok = outcome.is_ok(), "decoded frame");
        if results.send((job.frame, outcome)).is_err() {
            break;
        }
    }
}

fn panic_payload(payload: &Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderSession;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.dimension = 64;
        config.index.embedding_dimensions = 64;
        config.retrieval.decode_workers = Some(2);
        config
    }

    fn archive(dir: &TempDir, chunks: &[&str]) -> (PathBuf, PathBuf) {
        let media = dir.path().join("archive.fvm");
        let index = dir.path().join("archive.json");
        let session = EncoderSession::new(config()).unwrap();
        session.add_chunks(chunks.iter().copied()).unwrap();
        session.build(&media, &index).unwrap();
        (media, index)
    }

    #[test]
    fn search_returns_full_text_in_rank_order() {
        let dir = TempDir::new().unwrap();
        let long = format!("zebra {}", "stripes ".repeat(30));
        let (media, index) = archive(&dir, &["lion pride", long.trim(), "eagle nest"]);
        let mut session = RetrieverSession::open(&media, &index, &config()).unwrap();

        let hits = session.search_with_metadata("zebra stripes", 3).unwrap();
        assert_eq!(hits[0].chunk_id, 1);
        assert_eq!(hits[0].text, long.trim());
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn cache_hit_skips_media_scan() {
        let dir = TempDir::new().unwrap();
        let (media, index) = archive(&dir, &["alpha one", "beta two", "gamma three"]);
        let mut session = RetrieverSession::open(&media, &index, &config()).unwrap();

        session.search("beta two", 1).unwrap();
        assert_eq!(session.stats().media_scans, 1);
        session.search("beta two", 1).unwrap();
        assert_eq!(session.stats().media_scans, 1);
        assert_eq!(session.stats().cache_size, 1);
    }

    #[test]
    fn missing_media_falls_back_to_snippets() {
        let dir = TempDir::new().unwrap();
        let long = "w".repeat(150);
        let (media, index) = archive(&dir, &[long.as_str(), "short"]);
        std::fs::remove_file(&media).unwrap();

        let mut session = RetrieverSession::open(&media, &index, &config()).unwrap();
        let text = session.get_chunk_by_id(0).unwrap();
        assert_eq!(text.chars().count(), 100);
        assert_eq!(session.stats().decode_failures, 1);
    }

    #[test]
    fn context_window_is_in_id_order() {
        let dir = TempDir::new().unwrap();
        let (media, index) = archive(&dir, &["c0", "c1", "c2", "c3", "c4"]);
        let mut session = RetrieverSession::open(&media, &index, &config()).unwrap();
        assert_eq!(session.get_context_window(1, 1), vec!["c0", "c1", "c2"]);
        assert_eq!(session.get_context_window(4, 2), vec!["c2", "c3", "c4"]);
        assert!(session.get_chunk_by_id(99).is_none());
    }

    #[test]
    fn prefetch_warms_cache_in_one_scan() {
        let dir = TempDir::new().unwrap();
        let chunks: Vec<String> = (0..20).map(|i| format!("chunk number {i}")).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let (media, index) = archive(&dir, &refs);
        let mut session = RetrieverSession::open(&media, &index, &config()).unwrap();

        assert_eq!(session.prefetch_frames(&[3, 9, 17, 400]), 3);
        let stats = session.stats();
        assert_eq!(stats.media_scans, 1);
        assert_eq!(stats.frames_decoded, 3);
        assert_eq!(session.get_chunk_by_id(9).unwrap(), "chunk number 9");
        assert_eq!(session.stats().media_scans, 1);
    }
}
