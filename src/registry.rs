//! Capability registry handed to encode and retrieve sessions.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{EmbeddingProvider, HashingEmbedder};
use crate::error::Result;
use crate::frame::{FrameCodec, PacketStreamCodec};
use crate::symbol::{GridSymbolCodec, SymbolCodec};
use crate::text::{Chunker, SentenceChunker};

#[cfg(feature = "api_embed")]
use crate::api_embed::{OPENAI_MODEL_PREFIX, OpenAIConfig, OpenAIEmbedder};

/// The external collaborators a session calls into.
///
/// Built once by the caller and cloned into every session; clones share
/// the same provider instances.
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub symbol: Arc<dyn SymbolCodec>,
    pub frames: Arc<dyn FrameCodec>,
    pub chunker: Arc<dyn Chunker>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("embedder", &self.embedder.kind())
            .field("model", &self.embedder.model())
            .field("dimension", &self.embedder.dimension())
            .finish_non_exhaustive()
    }
}

impl Capabilities {
    /// Default collaborators for `config`. An `openai:<model>` embedding
    /// model selects the HTTP provider and needs the `api_embed` feature.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = embedder_for(config)?;
        tracing::debug!(
            kind = embedder.kind(),
            model = embedder.model(),
            dimension = embedder.dimension(),
            "resolved embedding provider"
        );
        Ok(Self {
            embedder,
            symbol: Arc::new(GridSymbolCodec::new()),
            frames: Arc::new(PacketStreamCodec::new()),
            chunker: Arc::new(SentenceChunker),
        })
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    #[must_use]
    pub fn with_symbol_codec(mut self, symbol: Arc<dyn SymbolCodec>) -> Self {
        self.symbol = symbol;
        self
    }

    #[must_use]
    pub fn with_frame_codec(mut self, frames: Arc<dyn FrameCodec>) -> Self {
        self.frames = frames;
        self
    }

    #[must_use]
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }
}

#[cfg(feature = "api_embed")]
fn embedder_for(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if let Some(model) = config.embedding.model.strip_prefix(OPENAI_MODEL_PREFIX) {
        let openai = OpenAIConfig {
            model: model.to_string(),
            dimension: config.embedding.dimension,
            batch_size: config.embedding.batch_size,
            ..OpenAIConfig::default()
        };
        return Ok(Arc::new(OpenAIEmbedder::new(openai)?));
    }
    Ok(Arc::new(HashingEmbedder::new(&config.embedding)))
}

#[cfg(not(feature = "api_embed"))]
fn embedder_for(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if config.embedding.model.starts_with("openai:") {
        return Err(crate::error::ArchiveError::validation(format!(
            "embedding model '{}' requires the api_embed feature",
            config.embedding.model
        )));
    }
    Ok(Arc::new(HashingEmbedder::new(&config.embedding)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_hashing_embedder() {
        let caps = Capabilities::from_config(&Config::default()).unwrap();
        assert_eq!(caps.embedder.kind(), "hashing");
        assert_eq!(caps.embedder.dimension(), 384);
    }

    #[test]
    fn overrides_replace_collaborators() {
        let mut config = Config::default();
        config.embedding.dimension = 16;
        let caps = Capabilities::from_config(&Config::default())
            .unwrap()
            .with_embedder(Arc::new(HashingEmbedder::new(&config.embedding)));
        assert_eq!(caps.embedder.dimension(), 16);
    }

    #[cfg(not(feature = "api_embed"))]
    #[test]
    fn openai_model_needs_feature() {
        let mut config = Config::default();
        config.embedding.model = "openai:text-embedding-3-small".to_string();
        assert!(Capabilities::from_config(&config).is_err());
    }
}
