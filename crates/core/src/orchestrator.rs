use crate::config::RetrievalConfig;
use crate::context::ContextAssembler;
use crate::fusion::fuse;
use crate::rerank::Reranker;
use crate::traits::Retriever;
use crate::{Candidate, RetrievalError, RetrievalRequest, RetrievedContext, SearchMode, SearchQuery};
use tokio::time::timeout;
use tracing::{info, warn};

/// The retrieval call: graph and vector search, fusion, rerank, context assembly.
pub struct HybridRetriever<G, V>
where
    G: Retriever,
    V: Retriever,
{
    graph: G,
    vector: V,
    reranker: Reranker,
    assembler: ContextAssembler,
    config: RetrievalConfig,
}

impl<G, V> HybridRetriever<G, V>
where
    G: Retriever,
    V: Retriever,
{
    pub fn new(graph: G, vector: V, reranker: Reranker, config: RetrievalConfig) -> Self {
        Self {
            graph,
            vector,
            reranker,
            assembler: ContextAssembler::new(config.graph_context_items),
            config,
        }
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn vector(&self) -> &V {
        &self.vector
    }

    /// A request carrying the configured defaults.
    pub fn request(&self, query: impl Into<String>) -> RetrievalRequest {
        RetrievalRequest {
            query: query.into(),
            k: self.config.k,
            rerank_top: self.config.rerank_top,
            min_graph_score: self.config.min_graph_score,
        }
    }

    /// Never fails: timeouts and source failures degrade to a smaller or empty context.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievedContext {
        match self.try_retrieve(request).await {
            Ok(retrieved) => retrieved,
            Err(error) => {
                warn!(error = %error, query = %request.query, "retrieval abandoned, answering without context");
                RetrievedContext::empty()
            }
        }
    }

    pub async fn try_retrieve(&self, request: &RetrievalRequest) -> Result<RetrievedContext, RetrievalError> {
        let limit = self.config.retrieval_timeout;
        timeout(limit, self.run(request))
            .await
            .map_err(|_| RetrievalError::Timeout(limit))
    }

    async fn run(&self, request: &RetrievalRequest) -> RetrievedContext {
        if request.query.trim().is_empty() {
            return RetrievedContext::empty();
        }

        let graph_query =
            SearchQuery::new(request.query.as_str(), request.k).with_min_score(request.min_graph_score);
        let vector_query = SearchQuery::new(request.query.as_str(), request.k);

        let (graph_hits, vector_hits) = tokio::join!(
            self.graph.search(&graph_query),
            self.vector.search(&vector_query)
        );
        let mut graph_hits = or_empty(self.graph.mode(), graph_hits);
        let vector_hits = or_empty(self.vector.mode(), vector_hits);

        let fusion = fuse(&graph_hits, &vector_hits, request.k);
        let reranked = self
            .reranker
            .rerank(&request.query, fusion.candidates, request.rerank_top)
            .await;

        graph_hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        let assembled = self
            .assembler
            .assemble(&graph_hits, &reranked, fusion.graph_hit_count);

        info!(
            graph_hits = graph_hits.len(),
            vector_hits = vector_hits.len(),
            documents = assembled.documents.len(),
            node_count = assembled.node_count,
            "retrieval finished"
        );
        assembled
    }
}

fn or_empty(mode: SearchMode, result: Result<Vec<Candidate>, RetrievalError>) -> Vec<Candidate> {
    match result {
        Ok(hits) => hits,
        Err(error) => {
            warn!(source = mode.tag(), error = %error, "retrieval source failed, continuing without it");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::CrossEncoder;
    use crate::CandidateMetadata;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeSource {
        mode: SearchMode,
        hits: Result<Vec<Candidate>, String>,
        delay: Duration,
    }

    impl FakeSource {
        fn graph(hashes: &[&str]) -> Self {
            Self::with_hits(SearchMode::Graph, hashes)
        }

        fn vector(hashes: &[&str]) -> Self {
            Self::with_hits(SearchMode::Vector, hashes)
        }

        fn with_hits(mode: SearchMode, hashes: &[&str]) -> Self {
            let hits = hashes
                .iter()
                .enumerate()
                .map(|(index, hash)| Candidate {
                    id: format!("{}-{hash}", mode.tag()),
                    content: format!("{} passage {hash}", mode.tag()),
                    score: 1.0 - index as f64 * 0.1,
                    source_hash: hash.to_string(),
                    metadata: CandidateMetadata::default(),
                    origin: mode,
                    rerank_score: None,
                })
                .collect();
            Self {
                mode,
                hits: Ok(hits),
                delay: Duration::ZERO,
            }
        }

        fn failing(mode: SearchMode) -> Self {
            Self {
                mode,
                hits: Err("store unreachable".to_string()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Retriever for FakeSource {
        fn mode(&self) -> SearchMode {
            self.mode
        }

        async fn search(&self, query: &SearchQuery) -> Result<Vec<Candidate>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            match &self.hits {
                Ok(hits) => Ok(hits.iter().take(query.k).cloned().collect()),
                Err(details) => Err(RetrievalError::connection(self.mode.tag(), details)),
            }
        }
    }

    struct ReverseOrder;

    impl CrossEncoder for ReverseOrder {
        fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, RetrievalError> {
            Ok((0..passages.len()).map(|index| index as f32).collect())
        }
    }

    fn retriever(graph: FakeSource, vector: FakeSource) -> HybridRetriever<FakeSource, FakeSource> {
        let config = RetrievalConfig {
            graph_context_items: 1,
            retrieval_timeout: Duration::from_millis(200),
            ..RetrievalConfig::default()
        };
        HybridRetriever::new(graph, vector, Reranker::new(Arc::new(ReverseOrder)), config)
    }

    fn hashes(retrieved: &RetrievedContext) -> Vec<&str> {
        retrieved
            .documents
            .iter()
            .map(|doc| doc.source_hash.as_str())
            .collect()
    }

    #[tokio::test]
    async fn fuses_reranks_and_assembles() {
        let hybrid = retriever(
            FakeSource::graph(&["h1", "h2"]),
            FakeSource::vector(&["h3", "h2", "h1"]),
        );

        let retrieved = hybrid.retrieve(&hybrid.request("relief valve")).await;

        // graph leader h1, then fused vector hits [h2, h1] reversed by the encoder
        assert_eq!(hashes(&retrieved), vec!["h1", "h2"]);
        assert_eq!(retrieved.documents[1].origin, SearchMode::Vector);
        assert_eq!(retrieved.node_count, 2);
        assert!(retrieved.context.starts_with("[graph] graph passage h1"));
    }

    #[tokio::test]
    async fn graph_outage_degrades_to_vector_only() {
        let hybrid = retriever(
            FakeSource::failing(SearchMode::Graph),
            FakeSource::vector(&["v1", "v2"]),
        );

        let retrieved = hybrid.retrieve(&hybrid.request("relief valve")).await;

        assert_eq!(hashes(&retrieved), vec!["v2", "v1"]);
        assert_eq!(retrieved.node_count, 0);
    }

    #[tokio::test]
    async fn total_failure_yields_empty_context() {
        let hybrid = retriever(
            FakeSource::failing(SearchMode::Graph),
            FakeSource::failing(SearchMode::Vector),
        );

        let retrieved = hybrid.retrieve(&hybrid.request("relief valve")).await;

        assert_eq!(retrieved, RetrievedContext::empty());
    }

    #[tokio::test]
    async fn slow_sources_are_abandoned_at_the_deadline() {
        let mut slow = FakeSource::vector(&["v1"]);
        slow.delay = Duration::from_secs(5);
        let hybrid = retriever(FakeSource::graph(&["h1"]), slow);
        let request = hybrid.request("relief valve");

        assert!(matches!(
            hybrid.try_retrieve(&request).await,
            Err(RetrievalError::Timeout(_))
        ));
        assert!(hybrid.retrieve(&request).await.is_empty());
    }

    #[tokio::test]
    async fn blank_query_skips_the_stores() {
        let hybrid = retriever(FakeSource::graph(&["h1"]), FakeSource::vector(&["h1"]));
        assert!(hybrid.retrieve(&hybrid.request("   ")).await.is_empty());
    }
}
