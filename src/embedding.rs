//! Embedding provider trait and the offline hashing embedder.
//!
//! The `EmbeddingProvider` trait defines a unified interface for turning text
//! into fixed-length vectors. The archive index only ever talks to this
//! trait; the model behind it is an external concern.

use unicode_segmentation::UnicodeSegmentation;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

pub type EmbeddingResult = std::result::Result<Vec<f32>, EmbeddingError>;
pub type BatchEmbeddingResult = std::result::Result<Vec<Vec<f32>>, EmbeddingError>;

/// Trait for embedding providers that generate vector embeddings from text.
///
/// # Example
///
/// ```ignore
/// use framevault::embedding::{EmbeddingProvider, HashingEmbedder};
/// use framevault::config::EmbeddingConfig;
///
/// let embedder = HashingEmbedder::new(&EmbeddingConfig::default());
/// let vector = embedder.embed_text("hello world")?;
/// assert_eq!(vector.len(), embedder.dimension());
/// ```
pub trait EmbeddingProvider: Send + Sync {
    /// Return the provider kind (e.g., "hashing", "openai").
    fn kind(&self) -> &str;

    /// Return the model identifier.
    fn model(&self) -> &str;

    /// Return the embedding dimension.
    fn dimension(&self) -> usize;

    /// Generate an embedding for a single text string.
    fn embed_text(&self, text: &str) -> EmbeddingResult;

    /// Generate embeddings for multiple text strings.
    ///
    /// Default implementation calls `embed_text` in a loop.
    /// Providers should override this for efficient batch processing.
    fn embed_batch(&self, texts: &[&str]) -> BatchEmbeddingResult {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_text(text)?);
        }
        Ok(embeddings)
    }

    /// Check if the provider is ready to generate embeddings.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Deterministic, offline embedder based on character n-gram feature hashing.
///
/// Each word contributes its padded character bigrams and trigrams plus the
/// whole word; features are hashed with blake3 into `dimension` buckets and
/// the result is L2-normalised. Texts that share spelling land close together
/// under cosine distance, which is all an offline default needs.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model: String,
    dimension: usize,
    max_words: usize,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone(),
            dimension: config.dimension.max(1),
            max_words: config.max_sequence_length.max(1),
        }
    }

    fn bucket(&self, feature: &[u8]) -> usize {
        let digest = blake3::hash(feature);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.dimension as u64) as usize
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str) {
        vector[self.bucket(feature.as_bytes())] += 1.0;
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn kind(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_text(&self, text: &str) -> EmbeddingResult {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let mut vector = vec![0.0f32; self.dimension];
        let mut words = 0usize;
        for word in text.unicode_words().take(self.max_words) {
            let word = word.to_lowercase();
            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for n in 2..=3 {
                for gram in padded.windows(n) {
                    let gram: String = gram.iter().collect();
                    self.add_feature(&mut vector, &gram);
                }
            }
            self.add_feature(&mut vector, &format!("w:{word}"));
            words += 1;
        }
        if words == 0 {
            // Punctuation-only input: hash the raw characters instead.
            for ch in text.trim().chars() {
                self.add_feature(&mut vector, &ch.to_string());
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}
