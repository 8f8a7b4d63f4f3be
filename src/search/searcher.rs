//! Similarity search against the reference catalog

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::crop::encode_jpeg;
use crate::detection::DetectedStamp;
use crate::search::collaborators::{
    Describer, Embedder, ReferenceEntry, SearchFilters, VectorStore,
};
use crate::search::tier::MatchTier;
use crate::{Result, StampError};

/// A reference entry matched by a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub entry: ReferenceEntry,
    /// Similarity in [0, 1]
    pub similarity: f32,
    /// 1-based position in the ranked list
    pub rank: usize,
}

impl SearchResult {
    pub fn percentage(&self) -> f32 {
        self.similarity * 100.0
    }

    pub fn tier(&self, config: &SearchConfig) -> MatchTier {
        MatchTier::classify(self.similarity, config.auto_threshold, config.min_threshold)
    }
}

/// Outcome of identifying one description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentificationResult {
    pub query_description: String,
    /// At most `top_k` results, best first
    pub top_matches: Vec<SearchResult>,
    pub tier: MatchTier,
    /// Set only for `AutoAccept`
    pub auto_match: Option<SearchResult>,
}

impl IdentificationResult {
    fn no_match(query_description: String) -> Self {
        Self {
            query_description,
            top_matches: Vec::new(),
            tier: MatchTier::NoMatch,
            auto_match: None,
        }
    }

    pub fn has_match(&self) -> bool {
        !self.top_matches.is_empty()
    }

    /// The auto match if there is one, otherwise the top candidate
    pub fn best_match(&self) -> Option<&SearchResult> {
        self.auto_match.as_ref().or_else(|| self.top_matches.first())
    }
}

/// Identification of one detected stamp in a batch
#[derive(Debug)]
pub struct StampIdentification {
    pub detection_id: String,
    /// `None` when the stamp failed before a description was produced
    pub description: Option<String>,
    pub outcome: Result<IdentificationResult>,
}

impl StampIdentification {
    fn failed(detection_id: String, description: Option<String>, error: StampError) -> Self {
        Self {
            detection_id,
            description,
            outcome: Err(error),
        }
    }

    pub fn tier(&self) -> Option<MatchTier> {
        self.outcome.as_ref().ok().map(|r| r.tier)
    }
}

/// Per-tier counts over a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdentificationSummary {
    pub auto_accept: usize,
    pub review: usize,
    pub no_match: usize,
    pub failed: usize,
}

impl IdentificationSummary {
    pub fn from_identifications(identifications: &[StampIdentification]) -> Self {
        let mut summary = Self::default();
        for identification in identifications {
            match identification.tier() {
                Some(MatchTier::AutoAccept) => summary.auto_accept += 1,
                Some(MatchTier::Review) => summary.review += 1,
                Some(MatchTier::NoMatch) => summary.no_match += 1,
                None => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.auto_accept + self.review + self.no_match + self.failed
    }
}

/// Searches the reference catalog through an embedder and a vector store
///
/// Holds no mutable state; clones share the same collaborators.
#[derive(Clone)]
pub struct Searcher {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: SearchConfig,
}

impl std::fmt::Debug for Searcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Searcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Searcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: SearchConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Ranked search for a free-text query
    ///
    /// `min_threshold` defaults to the configured minimum.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
        min_threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(StampError::Embedding {
                message: "cannot embed empty text".into(),
            });
        }
        let vector = self.embedder.embed(query).await?;
        let min_similarity = min_threshold.unwrap_or(self.config.min_threshold);
        let hits = self
            .store
            .search(&vector, top_k, min_similarity, filters)
            .await?;

        debug!(query_len = query.len(), hits = hits.len(), "vector search complete");
        Ok(rank(
            hits.into_iter().filter(|(_, similarity)| *similarity >= min_similarity),
        ))
    }

    /// Identify a stamp from its description
    ///
    /// # Errors
    ///
    /// Embedder and vector store failures propagate; they never turn into a
    /// `NoMatch`.
    pub async fn identify(&self, description: &str, top_k: usize) -> Result<IdentificationResult> {
        self.identify_filtered(description, top_k, &SearchFilters::default())
            .await
    }

    pub async fn identify_filtered(
        &self,
        description: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<IdentificationResult> {
        let mut matches = self
            .search(description, top_k.saturating_mul(2), filters, None)
            .await?;

        let Some(best) = matches.first() else {
            info!(tier = MatchTier::NoMatch.as_str(), "identification complete");
            return Ok(IdentificationResult::no_match(description.to_string()));
        };

        let tier = best.tier(&self.config);
        let auto_match = (tier == MatchTier::AutoAccept).then(|| best.clone());
        matches.truncate(top_k);

        info!(
            tier = tier.as_str(),
            best_similarity = matches.first().map(|m| m.similarity),
            matches = matches.len(),
            "identification complete"
        );

        Ok(IdentificationResult {
            query_description: description.to_string(),
            top_matches: matches,
            tier,
            auto_match,
        })
    }

    /// Entries most similar to a stored entry
    ///
    /// # Errors
    ///
    /// `StampError::EntryNotFound` for an unknown id and `StampError::Search`
    /// when the entry has no embedding.
    pub async fn find_similar(
        &self,
        entry_id: &str,
        top_k: usize,
        exclude_self: bool,
    ) -> Result<Vec<SearchResult>> {
        let seed = self
            .store
            .get(entry_id)
            .await?
            .ok_or_else(|| StampError::EntryNotFound {
                id: entry_id.to_string(),
            })?;
        if !seed.has_embedding() {
            return Err(StampError::Search {
                message: format!("entry {} has no embedding", entry_id),
            });
        }

        let limit = top_k + usize::from(exclude_self);
        let hits = self
            .store
            .search(&seed.embedding, limit, 0.0, &SearchFilters::default())
            .await?;

        let mut results = rank(
            hits.into_iter()
                .filter(|(entry, _)| !(exclude_self && entry.id == seed.id)),
        );
        results.truncate(top_k);
        Ok(results)
    }

    /// Describe and identify each stamp, at most `limit` at a time
    ///
    /// Results come back in input order. A failure on one stamp is recorded
    /// in its `outcome` and does not affect the others.
    pub async fn identify_stamps(
        &self,
        stamps: &[DetectedStamp],
        describer: Arc<dyn Describer>,
        top_k: usize,
        limit: usize,
    ) -> Vec<StampIdentification> {
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let mut slots: Vec<Option<StampIdentification>> = Vec::with_capacity(stamps.len());
        let mut ids = Vec::with_capacity(stamps.len());
        let mut tasks = JoinSet::new();

        for (index, stamp) in stamps.iter().enumerate() {
            ids.push(stamp.id.clone());
            let jpeg = match encode_jpeg(&stamp.crop) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!(id = %stamp.id, error = %e, "could not encode crop");
                    slots.push(Some(StampIdentification::failed(stamp.id.clone(), None, e)));
                    continue;
                }
            };
            slots.push(None);

            let searcher = self.clone();
            let describer = Arc::clone(&describer);
            let semaphore = Arc::clone(&semaphore);
            let detection_id = stamp.id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let identification = searcher
                    .identify_crop(detection_id, &jpeg, describer.as_ref(), top_k)
                    .await;
                (index, identification)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, identification)) => slots[index] = Some(identification),
                Err(e) => warn!(error = %e, "identification task did not complete"),
            }
        }

        ids.into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                slot.unwrap_or_else(|| {
                    let error = StampError::Search {
                        message: "identification task did not complete".into(),
                    };
                    StampIdentification::failed(id, None, error)
                })
            })
            .collect()
    }

    async fn identify_crop(
        &self,
        detection_id: String,
        jpeg: &[u8],
        describer: &dyn Describer,
        top_k: usize,
    ) -> StampIdentification {
        let description = match describer.describe(jpeg).await {
            Ok(description) => description,
            Err(e) => {
                warn!(id = %detection_id, error = %e, "description failed");
                return StampIdentification::failed(detection_id, None, e);
            }
        };

        let outcome = self.identify(&description, top_k).await;
        if let Err(e) = &outcome {
            warn!(id = %detection_id, error = %e, "identification failed");
        }
        StampIdentification {
            detection_id,
            description: Some(description),
            outcome,
        }
    }
}

fn rank(hits: impl IntoIterator<Item = (ReferenceEntry, f32)>) -> Vec<SearchResult> {
    hits.into_iter()
        .enumerate()
        .map(|(i, (entry, similarity))| SearchResult {
            entry,
            similarity,
            rank: i + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::collaborators::MemoryVectorStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Maps known texts to fixed vectors
    struct TableEmbedder(HashMap<String, Vec<f32>>);

    #[async_trait]
    impl Embedder for TableEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0.get(text).cloned().ok_or_else(|| StampError::Embedding {
                message: format!("unknown text: {}", text),
            })
        }
    }

    struct FailingStore;

    #[async_trait]
    impl VectorStore for FailingStore {
        async fn search(
            &self,
            _vector: &[f32],
            _limit: usize,
            _min_similarity: f32,
            _filters: &SearchFilters,
        ) -> Result<Vec<(ReferenceEntry, f32)>> {
            Err(StampError::VectorStore {
                message: "connection refused".into(),
            })
        }

        async fn get(&self, _id: &str) -> Result<Option<ReferenceEntry>> {
            Ok(None)
        }
    }

    fn entry(id: &str, embedding: Vec<f32>) -> ReferenceEntry {
        ReferenceEntry {
            id: id.into(),
            country: "France".into(),
            year: 1960,
            description: format!("stamp {}", id),
            embedding,
            catalog_url: String::new(),
            image_url: String::new(),
        }
    }

    /// Unit vector at `angle` radians; cosine with [1, 0] is `angle.cos()`
    fn at_angle(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    fn searcher(store: MemoryVectorStore) -> Searcher {
        let table = HashMap::from([
            ("marianne".to_string(), vec![1.0, 0.0]),
            ("unrelated".to_string(), vec![-1.0, 0.0]),
        ]);
        Searcher::new(
            Arc::new(TableEmbedder(table)),
            Arc::new(store),
            SearchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_identify_auto_accept() {
        // cos(0.3) ~ 0.955
        let store: MemoryVectorStore = [entry("a", at_angle(0.3))].into_iter().collect();
        let result = searcher(store).identify("marianne", 3).await.unwrap();

        assert_eq!(result.tier, MatchTier::AutoAccept);
        let auto = result.auto_match.as_ref().unwrap();
        assert_eq!(auto.entry.id, "a");
        assert_eq!(auto.rank, 1);
        assert_eq!(result.best_match().unwrap().entry.id, "a");
    }

    #[tokio::test]
    async fn test_identify_review() {
        // cos(0.8) ~ 0.697
        let store: MemoryVectorStore = [entry("a", at_angle(0.8))].into_iter().collect();
        let result = searcher(store).identify("marianne", 3).await.unwrap();

        assert_eq!(result.tier, MatchTier::Review);
        assert!(result.auto_match.is_none());
        assert!(result.has_match());
        assert_eq!(result.best_match().unwrap().entry.id, "a");
    }

    #[tokio::test]
    async fn test_identify_no_match() {
        let store: MemoryVectorStore = [entry("a", at_angle(1.3))].into_iter().collect();
        let result = searcher(store).identify("marianne", 3).await.unwrap();

        assert_eq!(result.tier, MatchTier::NoMatch);
        assert!(!result.has_match());
        assert!(result.best_match().is_none());
    }

    #[tokio::test]
    async fn test_identify_keeps_top_k() {
        let store: MemoryVectorStore = (0..6)
            .map(|i| entry(&format!("e{}", i), at_angle(0.1 * i as f32)))
            .collect();
        let result = searcher(store).identify("marianne", 2).await.unwrap();

        let ids: Vec<_> = result.top_matches.iter().map(|m| m.entry.id.as_str()).collect();
        assert_eq!(ids, ["e0", "e1"]);
        let ranks: Vec<_> = result.top_matches.iter().map(|m| m.rank).collect();
        assert_eq!(ranks, [1, 2]);
    }

    #[tokio::test]
    async fn test_identify_is_idempotent() {
        let store: MemoryVectorStore = (0..4)
            .map(|i| entry(&format!("e{}", i), at_angle(0.2 * i as f32)))
            .collect();
        let searcher = searcher(store);

        let first = searcher.identify("marianne", 3).await.unwrap();
        let second = searcher.identify("marianne", 3).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_identify_propagates_collaborator_errors() {
        let searcher = searcher(MemoryVectorStore::new());
        assert!(matches!(
            searcher.identify("never embedded", 3).await,
            Err(StampError::Embedding { .. })
        ));
        assert!(matches!(
            searcher.identify("   ", 3).await,
            Err(StampError::Embedding { .. })
        ));

        let table = HashMap::from([("marianne".to_string(), vec![1.0, 0.0])]);
        let failing = Searcher::new(
            Arc::new(TableEmbedder(table)),
            Arc::new(FailingStore),
            SearchConfig::default(),
        );
        assert!(matches!(
            failing.identify("marianne", 3).await,
            Err(StampError::VectorStore { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_similar_excludes_seed() {
        let store: MemoryVectorStore = [
            entry("seed", at_angle(0.0)),
            entry("close", at_angle(0.1)),
            entry("closer", at_angle(0.05)),
            entry("far", at_angle(1.5)),
        ]
        .into_iter()
        .collect();
        let searcher = searcher(store);

        let results = searcher.find_similar("seed", 2, true).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, ["closer", "close"]);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);

        let with_self = searcher.find_similar("seed", 2, false).await.unwrap();
        assert_eq!(with_self[0].entry.id, "seed");
        assert_eq!(with_self.len(), 2);
    }

    #[tokio::test]
    async fn test_find_similar_errors() {
        let store: MemoryVectorStore = [entry("bare", Vec::new())].into_iter().collect();
        let searcher = searcher(store);

        assert!(matches!(
            searcher.find_similar("missing", 3, true).await,
            Err(StampError::EntryNotFound { .. })
        ));
        assert!(matches!(
            searcher.find_similar("bare", 3, true).await,
            Err(StampError::Search { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_with_filters_and_threshold() {
        let mut italian = entry("it", at_angle(0.0));
        italian.country = "Italy".into();
        let store: MemoryVectorStore = [italian, entry("fr", at_angle(0.6))].into_iter().collect();
        let searcher = searcher(store);

        let french = searcher
            .search("marianne", 5, &SearchFilters::default().country("France"), None)
            .await
            .unwrap();
        assert_eq!(french.len(), 1);
        assert_eq!(french[0].entry.id, "fr");
        assert!((french[0].percentage() - french[0].similarity * 100.0).abs() < 1e-4);

        let strict = searcher
            .search("marianne", 5, &SearchFilters::default(), Some(0.99))
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].entry.id, "it");
    }

    #[test]
    fn test_summary_counts() {
        let result = |tier| IdentificationResult {
            query_description: String::new(),
            top_matches: Vec::new(),
            tier,
            auto_match: None,
        };
        let identifications = vec![
            StampIdentification {
                detection_id: "geometric-1".into(),
                description: Some("a".into()),
                outcome: Ok(result(MatchTier::AutoAccept)),
            },
            StampIdentification {
                detection_id: "geometric-2".into(),
                description: Some("b".into()),
                outcome: Ok(result(MatchTier::Review)),
            },
            StampIdentification::failed(
                "geometric-3".into(),
                None,
                StampError::Description {
                    message: "timeout".into(),
                },
            ),
        ];

        let summary = IdentificationSummary::from_identifications(&identifications);
        assert_eq!(summary.auto_accept, 1);
        assert_eq!(summary.review, 1);
        assert_eq!(summary.no_match, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
    }
}
