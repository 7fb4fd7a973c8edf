//! Integration tests for archive search and frame decoding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use framevault::frame::FrameStream;
use framevault::{
    ArchiveIndex, Capabilities, CodecParams, Config, EncoderSession, FrameCodec, FrameEncoder,
    GridSymbolCodec, HashingEmbedder, PacketStreamCodec, RetrieverSession, SymbolCodec,
    SymbolSettings,
};
use image::RgbImage;
use tempfile::TempDir;

#[derive(Default)]
struct CountingSymbolCodec {
    inner: GridSymbolCodec,
    decodes: AtomicUsize,
}

impl SymbolCodec for CountingSymbolCodec {
    fn encode(&self, payload: &[u8], settings: &SymbolSettings) -> framevault::Result<RgbImage> {
        self.inner.encode(payload, settings)
    }

    fn decode(&self, image: &RgbImage, settings: &SymbolSettings) -> framevault::Result<Vec<u8>> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(image, settings)
    }
}

#[derive(Default)]
struct CountingFrameCodec {
    inner: PacketStreamCodec,
    scans: AtomicUsize,
}

impl FrameCodec for CountingFrameCodec {
    fn encoder(&self, params: &CodecParams) -> framevault::Result<Box<dyn FrameEncoder>> {
        self.inner.encoder(params)
    }

    fn frames(&self, path: &Path) -> framevault::Result<FrameStream> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.frames(path)
    }
}

fn build_archive(dir: &TempDir, config: &Config, chunks: &[&str]) -> (PathBuf, PathBuf) {
    let media = dir.path().join("archive.fvm");
    let index = dir.path().join("archive.json");
    let session = EncoderSession::new(config.clone()).unwrap();
    session.add_chunks(chunks.iter().copied()).unwrap();
    session.build(&media, &index).unwrap();
    (media, index)
}

#[test]
fn encode_then_search_returns_stored_text() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let (media, index) = build_archive(
        &dir,
        &config,
        &[
            "The mitochondria is the powerhouse of the cell.",
            "Rust guarantees memory safety without a garbage collector.",
            "Paris is the capital of France.",
        ],
    );

    let mut session = RetrieverSession::open(&media, &index, &config).unwrap();
    let results = session.search("memory safety in Rust", 1).unwrap();
    assert_eq!(
        results,
        vec!["Rust guarantees memory safety without a garbage collector."]
    );
}

#[test]
fn search_prefers_similar_spelling() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
    let mut index = ArchiveIndex::create(&config, embedder).unwrap();
    index
        .add_items(&["apple", "apricot", "banana"], &[1, 2, 3])
        .unwrap();

    let path = dir.path().join("fruit.json");
    index.save(&path).unwrap();

    let hits: Vec<String> = index
        .search("apply", 2)
        .unwrap()
        .into_iter()
        .map(|chunk| chunk.text_snippet)
        .collect();
    assert_eq!(hits.len(), 2);
    assert!(hits.contains(&"apple".to_string()));
    assert!(hits.contains(&"apricot".to_string()));
    assert!(!hits.contains(&"banana".to_string()));
}

#[test]
fn cached_frames_are_not_decoded_again() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let (media, index) = build_archive(
        &dir,
        &config,
        &["red apples", "green pears", "yellow bananas", "purple plums"],
    );

    let symbol = Arc::new(CountingSymbolCodec::default());
    let frames = Arc::new(CountingFrameCodec::default());
    let caps = Capabilities::from_config(&config)
        .unwrap()
        .with_symbol_codec(symbol.clone())
        .with_frame_codec(frames.clone());
    let mut session = RetrieverSession::open_with(&media, &index, &config, caps).unwrap();

    assert_eq!(session.search("green pears", 1).unwrap(), vec!["green pears"]);
    assert_eq!(symbol.decodes.load(Ordering::SeqCst), 1);
    assert_eq!(frames.scans.load(Ordering::SeqCst), 1);

    assert_eq!(session.search("green pears", 1).unwrap(), vec!["green pears"]);
    assert_eq!(symbol.decodes.load(Ordering::SeqCst), 1);
    assert_eq!(frames.scans.load(Ordering::SeqCst), 1);

    // One cached frame and one new frame: only the new frame is decoded.
    let results = session.search("green pears", 2).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(symbol.decodes.load(Ordering::SeqCst), 2);
    assert_eq!(frames.scans.load(Ordering::SeqCst), 2);
    assert_eq!(session.stats().cache_size, 2);
}

#[test]
fn results_keep_rank_order_across_frames() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.retrieval.decode_workers = Some(3);
    let chunks: Vec<String> = (0..30)
        .map(|i| format!("document {i} about topic {}", i % 7))
        .collect();
    let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
    let (media, index) = build_archive(&dir, &config, &refs);

    let mut session = RetrieverSession::open(&media, &index, &config).unwrap();
    let hits = session.search_with_metadata("topic 3", 10).unwrap();
    assert_eq!(hits.len(), 10);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    for hit in &hits {
        assert_eq!(hit.text, chunks[hit.frame as usize]);
    }

    let expected: Vec<u64> = session
        .index()
        .search("topic 3", 10)
        .unwrap()
        .iter()
        .map(|chunk| chunk.id)
        .collect();
    let ranked: Vec<u64> = hits.iter().map(|hit| hit.chunk_id).collect();
    assert_eq!(ranked, expected);
}

#[test]
fn corrupt_media_falls_back_to_snippets() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let long = "needle ".repeat(30);
    let (media, index) = build_archive(&dir, &config, &[long.as_str(), "other"]);
    std::fs::write(&media, b"not a media file").unwrap();

    let mut session = RetrieverSession::open(&media, &index, &config).unwrap();
    let results = session.search("needle", 1).unwrap();
    assert_eq!(results[0], long.chars().take(100).collect::<String>());
}

#[test]
fn saved_index_roundtrips_through_load() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let (_, index_path) = build_archive(&dir, &config, &["one fish", "two fish", "red fish"]);

    let load = || {
        let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
        ArchiveIndex::load(&config, embedder, &index_path).unwrap()
    };
    let first = load();
    let copy = dir.path().join("copy.json");
    first.save(&copy).unwrap();

    let embedder = Arc::new(HashingEmbedder::new(&config.embedding));
    let second = ArchiveIndex::load(&config, embedder, &copy).unwrap();
    assert_eq!(first.metadata(), second.metadata());
    assert_eq!(first.frame_to_ids(), second.frame_to_ids());
    assert_eq!(second.search("red fish", 1).unwrap()[0].text_snippet, "red fish");
}

#[test]
fn default_config_stores_full_cjk_chunks() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    let text: String = (0..3000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            char::from_u32(0x4E00 + (state % 0x5000) as u32).unwrap()
        })
        .collect();

    let media = dir.path().join("cjk.fvm");
    let index = dir.path().join("cjk.json");
    let session = EncoderSession::new(config.clone()).unwrap();
    let pieces = session.add_text(&text).unwrap();
    assert!(pieces > 1);
    let stats = session.build(&media, &index).unwrap();
    assert_eq!(stats.total_chunks, pieces);

    let expected = framevault::text::chunk_text(
        &text,
        config.chunking.chunk_size,
        config.chunking.overlap,
    );
    let mut retriever = RetrieverSession::open(&media, &index, &config).unwrap();
    for (id, chunk) in expected.iter().enumerate() {
        assert_eq!(retriever.get_chunk_by_id(id as u64).as_ref(), Some(chunk));
    }
    assert_eq!(retriever.stats().decode_failures, 0);
}

#[test]
fn open_fails_without_index() {
    let dir = TempDir::new().unwrap();
    let result = RetrieverSession::open(
        dir.path().join("missing.fvm"),
        dir.path().join("missing.json"),
        &Config::default(),
    );
    assert!(result.is_err());
}
