//! Catalog identification module
//!
//! Turns stamp descriptions into ranked reference matches with a confidence
//! tier. Describing, embedding and vector search are external services
//! reached through the traits in [`collaborators`].

pub mod collaborators;
pub mod searcher;
pub mod tier;

pub use collaborators::{
    cosine_similarity, Describer, Embedder, MemoryVectorStore, ReferenceEntry, SearchFilters,
    VectorStore,
};
pub use searcher::{
    IdentificationResult, IdentificationSummary, SearchResult, Searcher, StampIdentification,
};
pub use tier::MatchTier;
