//! Validated configuration for encoding, indexing and retrieval.
//!
//! Settings are layered: built-in defaults, then an optional JSON file (every
//! section is `#[serde(default)]`, so partial files are fine), then
//! `FRAMEVAULT_*` environment overrides. [`Config::validate`] runs last and
//! every session constructor calls it again before doing any work.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_CODEC, DEFAULT_EF_CONSTRUCTION,
    DEFAULT_EF_SEARCH, DEFAULT_EMBEDDING_BATCH_SIZE, DEFAULT_EMBEDDING_DIMENSION,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_MAX_ELEMENTS, DEFAULT_MAX_SEQUENCE_LENGTH, ENV_PREFIX,
    MAX_RECORD_BYTES_PER_CHAR, RECORD_ENVELOPE_BYTES,
};
use crate::error::{ArchiveError, Result};
use crate::symbol::{GridSymbolCodec, packed_len_bound};

/// Minimum luma distance between fill and back colors for symbols to stay readable.
const MIN_COLOR_CONTRAST: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorCorrection {
    L,
    #[default]
    M,
    Q,
    H,
}

impl ErrorCorrection {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::L => 0,
            Self::M => 1,
            Self::Q => 2,
            Self::H => 3,
        }
    }
}

/// Visual-code options handed to the symbol codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolSettings {
    pub error_correction: ErrorCorrection,
    pub fill_color: String,
    pub back_color: String,
    pub gzip: bool,
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            error_correction: ErrorCorrection::M,
            fill_color: "black".to_string(),
            back_color: "white".to_string(),
            gzip: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Gray8 => 1,
        }
    }
}

/// How the media container compresses each packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketCompression {
    Zstd,
    Lz4,
    Stored,
}

/// A named frame codec and the geometry it implies.
#[derive(Debug, Clone)]
pub struct CodecProfile {
    pub name: &'static str,
    pub fps: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub pixel_format: PixelFormat,
    pub compression: PacketCompression,
}

/// Known codec profiles.
pub static CODEC_PROFILES: &[CodecProfile] = &[
    CodecProfile {
        name: "zstd",
        fps: 30,
        frame_width: 512,
        frame_height: 512,
        pixel_format: PixelFormat::Rgb24,
        compression: PacketCompression::Zstd,
    },
    CodecProfile {
        name: "lz4",
        fps: 30,
        frame_width: 512,
        frame_height: 512,
        pixel_format: PixelFormat::Rgb24,
        compression: PacketCompression::Lz4,
    },
    CodecProfile {
        name: "raw",
        fps: 15,
        frame_width: 512,
        frame_height: 512,
        pixel_format: PixelFormat::Gray8,
        compression: PacketCompression::Stored,
    },
];

#[must_use]
pub fn codec_profile(name: &str) -> Option<&'static CodecProfile> {
    CODEC_PROFILES
        .iter()
        .find(|profile| profile.name.eq_ignore_ascii_case(name))
}

/// Resolved frame-codec parameters for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParams {
    pub codec: String,
    pub fps: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub pixel_format: PixelFormat,
    pub compression: PacketCompression,
}

impl From<&CodecProfile> for CodecParams {
    fn from(profile: &CodecProfile) -> Self {
        Self {
            codec: profile.name.to_string(),
            fps: profile.fps,
            frame_width: profile.frame_width,
            frame_height: profile.frame_height,
            pixel_format: profile.pixel_format,
            compression: profile.compression,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model identifier. `hashing-ngram` selects the offline embedder,
    /// `openai:<model>` the HTTP provider (feature `api_embed`).
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub max_sequence_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
    Ip,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
            Self::Ip => "ip",
        })
    }
}

impl FromStr for Metric {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" => Ok(Self::L2),
            "ip" => Ok(Self::Ip),
            other => Err(ArchiveError::validation(format!(
                "unknown metric '{other}' (expected cosine, l2 or ip)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub metric: Metric,
    pub embedding_dimensions: usize,
    pub max_elements: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSION,
            max_elements: DEFAULT_MAX_ELEMENTS,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Frame decode pool size. `None` means twice the number of CPUs.
    pub decode_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub symbol: SymbolSettings,
    pub codec: String,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: SymbolSettings::default(),
            codec: DEFAULT_CODEC.to_string(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then the optional file, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data =
            std::fs::read_to_string(path).map_err(|err| ArchiveError::io_at(err, path))?;
        let config = serde_json::from_str(&data)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Apply overrides from `lookup`, keyed without the `FRAMEVAULT_` prefix.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(codec) = lookup("CODEC") {
            self.codec = codec.trim().to_string();
        }
        if let Some(value) = lookup("CHUNK_SIZE") {
            self.chunking.chunk_size = parse_override("CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("CHUNK_OVERLAP") {
            self.chunking.overlap = parse_override("CHUNK_OVERLAP", &value)?;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = model.trim().to_string();
        }
        if let Some(value) = lookup("EMBEDDING_DIMENSION") {
            let dimension = parse_override("EMBEDDING_DIMENSION", &value)?;
            self.embedding.dimension = dimension;
            self.index.embedding_dimensions = dimension;
        }
        if let Some(value) = lookup("INDEX_METRIC") {
            self.index.metric = value.parse()?;
        }
        if let Some(value) = lookup("EF_SEARCH") {
            self.index.ef_search = parse_override("EF_SEARCH", &value)?;
        }
        if let Some(value) = lookup("DECODE_WORKERS") {
            self.retrieval.decode_workers = Some(parse_override("DECODE_WORKERS", &value)?);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size <= self.chunking.overlap {
            return Err(ArchiveError::validation(format!(
                "chunk_size ({}) must be greater than overlap ({})",
                self.chunking.chunk_size, self.chunking.overlap
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(ArchiveError::validation("embedding dimension must be positive"));
        }
        if self.embedding.batch_size == 0 {
            return Err(ArchiveError::validation("embedding batch_size must be positive"));
        }
        if self.index.embedding_dimensions == 0 {
            return Err(ArchiveError::validation(
                "index embedding_dimensions must be positive",
            ));
        }
        if self.index.embedding_dimensions != self.embedding.dimension {
            return Err(ArchiveError::validation(format!(
                "index embedding_dimensions ({}) must equal embedding dimension ({})",
                self.index.embedding_dimensions, self.embedding.dimension
            )));
        }
        if self.index.max_elements == 0 {
            return Err(ArchiveError::validation("index max_elements must be positive"));
        }
        if self.index.ef_search == 0 {
            return Err(ArchiveError::validation("index ef_search must be positive"));
        }
        if self.retrieval.decode_workers == Some(0) {
            return Err(ArchiveError::validation("decode_workers must be positive"));
        }
        let Some(profile) = codec_profile(&self.codec) else {
            let known: Vec<&str> = CODEC_PROFILES.iter().map(|p| p.name).collect();
            return Err(ArchiveError::validation(format!(
                "unknown codec '{}' (known: {})",
                self.codec,
                known.join(", ")
            )));
        };
        let needed = self.worst_case_symbol_bytes();
        let capacity =
            GridSymbolCodec::capacity_for_side(profile.frame_width.min(profile.frame_height));
        if needed > capacity {
            return Err(ArchiveError::validation(format!(
                "chunk_size {} may pack to {needed} bytes, more than one {}x{} frame holds ({capacity})",
                self.chunking.chunk_size, profile.frame_width, profile.frame_height
            )));
        }
        let fill = parse_color(&self.symbol.fill_color)?;
        let back = parse_color(&self.symbol.back_color)?;
        if luma(fill).abs_diff(luma(back)) < MIN_COLOR_CONTRAST {
            return Err(ArchiveError::validation(format!(
                "fill color '{}' and back color '{}' are too similar",
                self.symbol.fill_color, self.symbol.back_color
            )));
        }
        Ok(())
    }

    /// Packed size of the largest chunk record the chunker can produce.
    #[must_use]
    pub fn worst_case_symbol_bytes(&self) -> usize {
        let record = self
            .chunking
            .chunk_size
            .saturating_mul(MAX_RECORD_BYTES_PER_CHAR)
            .saturating_add(RECORD_ENVELOPE_BYTES);
        packed_len_bound(record, self.symbol.gzip)
    }

    /// Frame codec parameters derived from the codec name.
    pub fn codec_params(&self) -> Result<CodecParams> {
        codec_profile(&self.codec)
            .map(CodecParams::from)
            .ok_or_else(|| ArchiveError::validation(format!("unknown codec '{}'", self.codec)))
    }

    #[must_use]
    pub fn decode_workers(&self) -> usize {
        self.retrieval
            .decode_workers
            .unwrap_or_else(|| num_cpus::get().saturating_mul(2))
            .max(1)
    }
}

fn parse_override<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ArchiveError::validation(format!("{ENV_PREFIX}{key}: cannot parse '{value}'"))
    })
}

/// Parse a named color or `#rrggbb`.
pub fn parse_color(value: &str) -> Result<[u8; 3]> {
    let value = value.trim();
    let named = match value.to_ascii_lowercase().as_str() {
        "black" => Some([0, 0, 0]),
        "white" => Some([255, 255, 255]),
        "red" => Some([255, 0, 0]),
        "green" => Some([0, 128, 0]),
        "blue" => Some([0, 0, 255]),
        "gray" | "grey" => Some([128, 128, 128]),
        _ => None,
    };
    if let Some(rgb) = named {
        return Ok(rgb);
    }
    let hex = value
        .strip_prefix('#')
        .filter(|hex| hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| ArchiveError::validation(format!("invalid color '{value}'")))?;
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&hex[range], 16)
            .map_err(|_| ArchiveError::validation(format!("invalid color '{value}'")))
    };
    Ok([channel(0..2)?, channel(2..4)?, channel(4..6)?])
}

/// ITU-R BT.601 luma.
#[must_use]
pub fn luma(rgb: [u8; 3]) -> u8 {
    let [r, g, b] = rgb.map(u32::from);
    ((r * 299 + g * 587 + b * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults are valid");
    }

    #[test]
    fn chunk_size_must_exceed_overlap() {
        let mut config = Config::default();
        config.chunking = ChunkingConfig {
            chunk_size: 32,
            overlap: 32,
        };
        assert!(matches!(
            config.validate(),
            Err(ArchiveError::Validation { .. })
        ));

        config.chunking.overlap = 0;
        config.validate().expect("overlap of zero is allowed");
    }

    #[test]
    fn every_codec_holds_a_default_chunk() {
        for profile in CODEC_PROFILES {
            for gzip in [true, false] {
                let mut config = Config {
                    codec: profile.name.to_string(),
                    ..Config::default()
                };
                config.symbol.gzip = gzip;
                config.validate().unwrap();
            }
        }
    }

    #[test]
    fn chunk_size_must_fit_one_frame() {
        let mut config = Config::default();
        config.chunking.chunk_size = 8192;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than one 512x512 frame holds"));
    }

    #[test]
    fn dimensions_must_agree() {
        let mut config = Config::default();
        config.index.embedding_dimensions = 128;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let config = Config {
            codec: "h265".to_string(),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown codec"));
    }

    #[test]
    fn low_contrast_colors_are_rejected() {
        let mut config = Config::default();
        config.symbol.fill_color = "#101010".to_string();
        config.symbol.back_color = "black".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn codec_params_follow_profile() {
        let config = Config {
            codec: "raw".to_string(),
            ..Config::default()
        };
        let params = config.codec_params().unwrap();
        assert_eq!(params.fps, 15);
        assert_eq!(params.pixel_format, PixelFormat::Gray8);
        assert_eq!(params.compression, PacketCompression::Stored);
    }

    #[test]
    fn overrides_apply_and_validate() {
        let config = Config::default()
            .with_overrides(|key| match key {
                "EMBEDDING_DIMENSION" => Some("64".to_string()),
                "INDEX_METRIC" => Some("L2".to_string()),
                "CODEC" => Some("lz4".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.embedding.dimension, 64);
        assert_eq!(config.index.embedding_dimensions, 64);
        assert_eq!(config.index.metric, Metric::L2);
        assert_eq!(config.codec, "lz4");
        config.validate().unwrap();
    }

    #[test]
    fn malformed_override_is_a_validation_error() {
        let err = Config::default()
            .with_overrides(|key| (key == "CHUNK_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Validation { .. }));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"chunking": {"chunk_size": 200}}"#).unwrap();
        assert_eq!(config.chunking.chunk_size, 200);
        assert_eq!(config.chunking.overlap, DEFAULT_CHUNK_OVERLAP);
        assert_eq!(config.codec, DEFAULT_CODEC);
    }

    #[test]
    fn colors_parse() {
        assert_eq!(parse_color("white").unwrap(), [255, 255, 255]);
        assert_eq!(parse_color("#ff8000").unwrap(), [255, 128, 0]);
        assert!(parse_color("#ff80").is_err());
        assert!(parse_color("teal").is_err());
    }
}
