//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] capability that all embedding backends
//! implement, a deterministic offline [`HashEmbedder`], and pure helper
//! functions for vector serialization and similarity computation.
//!
//! Network-backed providers (OpenAI, Ollama, fastembed) live in the
//! `knowledge-rag` app crate.

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::EmbeddingSpace;

/// Maps text to fixed-dimensional vectors.
///
/// The same provider instance embeds chunks at ingestion time and queries
/// at retrieval time. Implementations make a single attempt per call and
/// classify failures as transient or permanent; retry policy belongs to
/// the caller.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    fn space(&self) -> EmbeddingSpace {
        EmbeddingSpace {
            model: self.model_name().to_string(),
            dims: self.dims(),
        }
    }

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(RagError::permanent(format!(
                "expected 1 embedding, got {}",
                vectors.len()
            )));
        }
        Ok(vectors.remove(0))
    }
}

/// Validate a provider response against the request.
///
/// A count mismatch is a permanent provider error; a wrong vector length
/// is a [`RagError::DimensionMismatch`].
pub fn check_batch(inputs: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != inputs {
        return Err(RagError::permanent(format!(
            "provider returned {} embeddings for {} inputs",
            vectors.len(),
            inputs
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RagError::DimensionMismatch {
            expected: dims,
            actual: v.len(),
        });
    }
    Ok(())
}

// ============ Hash embedder ============

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Requires no network or model download, so it backs offline use and
/// tests. Texts sharing words land close together; it has no notion of
/// synonyms.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims,
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        let tokens = tokenize(text);
        for token in &tokens {
            add_feature(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            add_feature(&mut v, bigram.as_bytes(), 0.5);
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn add_feature(v: &mut [f32], feature: &[u8], weight: f32) {
    let h = fnv1a(feature);
    let idx = (h % v.len() as u64) as usize;
    let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    v[idx] += sign * weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ============ Vector utilities ============

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use knowledge_rag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, zero
/// vectors, or vectors of different lengths. Index build and query time
/// both go through this function.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_sync("Overtime is paid at 1.5x");
        let b = e.embed_sync("Overtime is paid at 1.5x");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_shared_words_are_closer() {
        let e = HashEmbedder::new(1024);
        let query = e.embed_sync("overtime pay rate");
        let related = e.embed_sync("Overtime\n\nPaid at 1.5x after 40 hours.");
        let unrelated = e.embed_sync("Parking permits are issued by facilities.");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_check_batch() {
        assert!(check_batch(2, 3, &[vec![0.0; 3], vec![0.0; 3]]).is_ok());
        assert!(matches!(
            check_batch(2, 3, &[vec![0.0; 3]]),
            Err(RagError::EmbeddingProvider {
                transient: false,
                ..
            })
        ));
        assert!(matches!(
            check_batch(1, 3, &[vec![0.0; 4]]),
            Err(RagError::DimensionMismatch {
                expected: 3,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_default_embed_uses_batch() {
        let e = HashEmbedder::new(16);
        let v = e.embed("hello world").await.unwrap();
        assert_eq!(v, e.embed_sync("hello world"));
        assert_eq!(e.space().dims, 16);
        assert_eq!(e.space().model, "hash-16");
    }
}
