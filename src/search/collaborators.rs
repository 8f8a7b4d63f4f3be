//! External services consumed by identification
//!
//! The describer turns a stamp image into text, the embedder turns text into
//! a vector, and the vector store answers nearest-neighbour queries against
//! the reference catalog. Only their boundaries are defined here, plus an
//! in-memory store for tests and small catalogs.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Result, StampError};

/// Reference catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// Catalog identifier
    pub id: String,
    pub country: String,
    pub year: i32,
    pub description: String,
    /// Empty when the entry has not been embedded yet
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub catalog_url: String,
    #[serde(default)]
    pub image_url: String,
}

impl ReferenceEntry {
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Optional restrictions passed through to the vector store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub country: Option<String>,
    pub year: Option<i32>,
}

impl SearchFilters {
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn matches(&self, entry: &ReferenceEntry) -> bool {
        self.country.as_deref().map_or(true, |c| c == entry.country)
            && self.year.map_or(true, |y| y == entry.year)
    }
}

/// Produces a text description of a stamp image
#[async_trait]
pub trait Describer: Send + Sync {
    /// Describe a JPEG-encoded stamp crop
    ///
    /// Failures are reported as `StampError::Description`.
    async fn describe(&self, jpeg: &[u8]) -> Result<String>;
}

/// Produces embedding vectors for text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text; empty text is `StampError::Embedding`
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts in order
    ///
    /// Empty or whitespace-only inputs map to empty vectors.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                vectors.push(Vec::new());
            } else {
                vectors.push(self.embed(text).await?);
            }
        }
        Ok(vectors)
    }
}

/// Nearest-neighbour search over reference entries
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Up to `limit` entries with similarity at or above `min_similarity`,
    /// sorted by descending similarity
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_similarity: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<(ReferenceEntry, f32)>>;

    async fn get(&self, id: &str) -> Result<Option<ReferenceEntry>>;
}

/// Cosine similarity of two equal-length vectors; 0.0 when either is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Vector store held in memory, scored by cosine similarity
///
/// Negative similarities are reported as 0.0.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<ReferenceEntry>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same id
    pub fn insert(&self, entry: ReferenceEntry) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FromIterator<ReferenceEntry> for MemoryVectorStore {
    fn from_iter<I: IntoIterator<Item = ReferenceEntry>>(iter: I) -> Self {
        let store = Self::new();
        for entry in iter {
            store.insert(entry);
        }
        store
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_similarity: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<(ReferenceEntry, f32)>> {
        let entries = self.entries.read();
        let mut scored = Vec::new();
        for entry in entries.iter().filter(|e| e.has_embedding() && filters.matches(e)) {
            if entry.embedding.len() != vector.len() {
                return Err(StampError::VectorStore {
                    message: format!(
                        "dimension mismatch for {}: query {} vs entry {}",
                        entry.id,
                        vector.len(),
                        entry.embedding.len()
                    ),
                });
            }
            let similarity = cosine_similarity(vector, &entry.embedding).clamp(0.0, 1.0);
            if similarity >= min_similarity {
                scored.push((entry.clone(), similarity));
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get(&self, id: &str) -> Result<Option<ReferenceEntry>> {
        Ok(self.entries.read().iter().find(|e| e.id == id).cloned())
    }
}
