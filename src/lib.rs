//! framevault: archive text corpora as frame-addressable media and search
//! them semantically.
//!
//! Every chunk of text is serialized into one 2D symbol, each symbol becomes
//! one frame of a media file, and an [`ArchiveIndex`] maps chunk embeddings
//! back to frame numbers. [`EncoderSession`] builds archives and
//! [`RetrieverSession`] searches them, decoding hit frames on demand.
//!
//! ```ignore
//! use framevault::{Config, EncoderSession, RetrieverSession};
//!
//! let config = Config::load(None)?;
//! let session = EncoderSession::new(config.clone())?;
//! session.add_text(&std::fs::read_to_string("notes.txt")?)?;
//! let stats = session.build("notes.fvm", "notes.json")?;
//!
//! let mut retriever = RetrieverSession::open("notes.fvm", "notes.json", &config)?;
//! for text in retriever.search("what did we decide?", 5)? {
//!     println!("{text}");
//! }
//! ```

#[cfg(feature = "api_embed")]
pub mod api_embed;
pub mod config;
pub mod constants;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod index;
pub mod registry;
pub mod retriever;
mod simd;
pub mod symbol;
pub mod text;
pub mod types;
mod util;
pub mod vec;

pub use config::{CodecParams, Config, Metric, SymbolSettings};
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use encoder::EncoderSession;
pub use error::{ArchiveError, EmbeddingError, Result, SessionState, StateError};
pub use frame::{FrameCodec, FrameEncoder, PacketStreamCodec};
pub use index::{ArchiveIndex, ChunkMetadata, IndexStats};
pub use registry::Capabilities;
pub use retriever::RetrieverSession;
pub use symbol::{GridSymbolCodec, SymbolCodec};
pub use text::{Chunker, SentenceChunker};
pub use types::{BuildStats, ChunkRecord, RetrieverStats, SearchHit, SessionInfo};
pub use util::vector_path;
pub use vec::{FlatVectorEngine, VectorEngine};
