/// Maximum characters of chunk text kept in index metadata.
pub const SNIPPET_CHARS: usize = 100;
/// Extension of the vector engine file written next to the index document.
pub const VECTOR_FILE_EXTENSION: &str = "vec";
/// Magic bytes for the vector engine file.
pub const VECTOR_MAGIC: [u8; 4] = *b"FVV1";
/// Magic bytes for the media container header.
pub const MEDIA_MAGIC: [u8; 4] = *b"FVMS";
/// Media container format version.
pub const MEDIA_VERSION: u16 = 1;
/// Frames stored per media packet.
pub const FRAMES_PER_PACKET: usize = 8;
/// Upper bound on a single media packet; guards the reader against corrupt lengths.
pub const MAX_PACKET_BYTES: usize = 256 * 1024 * 1024;
/// Upper bound for bincode decoding of persisted artifacts.
pub const MAX_ARTIFACT_BYTES: usize = 1024 * 1024 * 1024;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "FRAMEVAULT_";

/// Most bytes one chunk character can take in a serialized chunk record
/// (a control character escaped as `\u00XX`).
pub const MAX_RECORD_BYTES_PER_CHAR: usize = 6;
/// JSON around the text of a chunk record, with both ids at their widest.
pub const RECORD_ENVELOPE_BYTES: usize = 72;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_CHUNK_OVERLAP: usize = 32;
pub const DEFAULT_EMBEDDING_MODEL: &str = "hashing-ngram";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 32;
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 512;
pub const DEFAULT_MAX_ELEMENTS: usize = 100_000;
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
pub const DEFAULT_EF_SEARCH: usize = 50;
pub const DEFAULT_CODEC: &str = "zstd";
