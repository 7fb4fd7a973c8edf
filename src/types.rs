use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SessionState;
use crate::index::IndexStats;

/// Record serialized into every symbol. `id` is the frame number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    pub text: String,
    pub frame: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStats {
    pub total_chunks: usize,
    pub total_frames: usize,
    pub duration_seconds: f64,
    pub fps: u32,
    pub output_path: PathBuf,
    pub index_path: PathBuf,
    pub session_id: String,
    pub media_bytes: u64,
    pub index: IndexStats,
}

/// Point-in-time view of an encode session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub pending_chunks: usize,
    pub output_path: Option<PathBuf>,
    pub index_path: Option<PathBuf>,
    pub stats: Option<BuildStats>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
    pub distance: f32,
    pub chunk_id: u64,
    pub frame: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrieverStats {
    pub cache_size: usize,
    pub media_scans: u64,
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub index: IndexStats,
}
