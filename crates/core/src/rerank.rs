use crate::{Candidate, RetrievalError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Blocking (query, passage) relevance scorer.
pub trait CrossEncoder: Send + Sync {
    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RetrievalError>;
}

pub struct Reranker {
    encoder: Arc<dyn CrossEncoder>,
}

impl Reranker {
    pub fn new(encoder: Arc<dyn CrossEncoder>) -> Self {
        Self { encoder }
    }

    /// Orders candidates by cross-encoder score, highest first, keeping `top_n`.
    ///
    /// Scoring failures fall back to the first `top_n` candidates in their incoming order.
    pub async fn rerank(&self, query: &str, candidates: Vec<Candidate>, top_n: usize) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        match self.score_off_thread(query, &candidates).await {
            Ok(scores) => order_by_scores(candidates, &scores, top_n),
            Err(error) => {
                warn!(error = %error, candidates = candidates.len(), "rerank failed, keeping retrieval order");
                candidates.into_iter().take(top_n).collect()
            }
        }
    }

    async fn score_off_thread(
        &self,
        query: &str,
        candidates: &[Candidate],
    ) -> Result<Vec<f32>, RetrievalError> {
        let encoder = Arc::clone(&self.encoder);
        let query = query.to_string();
        let passages = candidates
            .iter()
            .map(|candidate| candidate.content.clone())
            .collect::<Vec<_>>();
        let expected = passages.len();

        let scores = tokio::task::spawn_blocking(move || encoder.score(&query, &passages))
            .await
            .map_err(|error| RetrievalError::Scoring(format!("cross-encoder task failed: {error}")))??;

        if scores.len() != expected {
            return Err(RetrievalError::Scoring(format!(
                "cross-encoder returned {} scores for {} passages",
                scores.len(),
                expected
            )));
        }
        Ok(scores)
    }
}

fn order_by_scores(candidates: Vec<Candidate>, scores: &[f32], top_n: usize) -> Vec<Candidate> {
    let mut scored = candidates
        .iter()
        .zip(scores.iter())
        .map(|(candidate, score)| candidate.with_rerank_score(finite_or_lowest(*score)))
        .collect::<Vec<_>>();

    // stable: equal scores keep retrieval order
    scored.sort_by(|left, right| {
        let left = left.rerank_score.unwrap_or(f64::NEG_INFINITY);
        let right = right.rerank_score.unwrap_or(f64::NEG_INFINITY);
        right.total_cmp(&left)
    });
    scored.truncate(top_n);

    debug!(kept = scored.len(), "reranked candidates");
    scored
}

/// NaN and infinite scores rank below every real score.
fn finite_or_lowest(score: f32) -> f64 {
    let score = f64::from(score);
    if score.is_finite() {
        score
    } else {
        f64::NEG_INFINITY
    }
}

/// Offline scorer: fraction of query terms present in the passage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapCrossEncoder;

impl CrossEncoder for TermOverlapCrossEncoder {
    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RetrievalError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        Ok(passages
            .iter()
            .map(|passage| {
                let passage_terms = terms(passage);
                let matched = query_terms
                    .iter()
                    .filter(|term| passage_terms.contains(*term))
                    .count();
                matched as f32 / query_terms.len() as f32
            })
            .collect())
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| token.len() > 2)
        .collect()
}

#[derive(Debug, Clone)]
pub struct RerankEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Debug, Deserialize)]
struct RerankEntry {
    index: usize,
    score: f32,
}

/// Text-embeddings-inference style `/rerank` endpoint.
#[derive(Debug, Clone)]
pub struct HttpCrossEncoder {
    config: RerankEndpointConfig,
    client: OnceLock<Client>,
}

impl HttpCrossEncoder {
    pub fn new(config: RerankEndpointConfig) -> Result<Self, RetrievalError> {
        url::Url::parse(&config.endpoint)?;
        Ok(Self {
            config,
            client: OnceLock::new(),
        })
    }

    /// One client per endpoint, built on first use from the blocking pool.
    fn client(&self) -> Result<&Client, RetrievalError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder().timeout(self.config.timeout).build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl CrossEncoder for HttpCrossEncoder {
    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RetrievalError> {
        let mut request = self
            .client()?
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&RerankRequest {
                query,
                texts: passages,
                raw_scores: false,
            });

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .map_err(|error| RetrievalError::Scoring(format!("rerank request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(RetrievalError::Scoring(format!(
                "rerank endpoint {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let entries: Vec<RerankEntry> = response
            .json()
            .map_err(|error| RetrievalError::Scoring(format!("rerank response unreadable: {error}")))?;
        scores_by_index(entries, passages.len())
    }
}

/// The endpoint answers sorted by score; put the scores back in passage order.
fn scores_by_index(entries: Vec<RerankEntry>, expected: usize) -> Result<Vec<f32>, RetrievalError> {
    let mut scores = vec![None; expected];
    for entry in entries {
        let slot = scores.get_mut(entry.index).ok_or_else(|| {
            RetrievalError::Scoring(format!("rerank index {} out of range", entry.index))
        })?;
        *slot = Some(entry.score);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| RetrievalError::Scoring(format!("rerank score missing for passage {index}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CandidateMetadata, SearchMode};
    use proptest::prelude::*;

    struct FixedScores(Vec<f32>);

    impl CrossEncoder for FixedScores {
        fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    struct FailingEncoder;

    impl CrossEncoder for FailingEncoder {
        fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, RetrievalError> {
            Err(RetrievalError::Scoring("model unavailable".to_string()))
        }
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            content: format!("passage {id}"),
            score: 0.0,
            source_hash: format!("hash-{id}"),
            metadata: CandidateMetadata::default(),
            origin: SearchMode::Vector,
            rerank_score: None,
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|candidate| candidate.id.as_str()).collect()
    }

    #[tokio::test]
    async fn sorts_descending_and_truncates() {
        let reranker = Reranker::new(Arc::new(FixedScores(vec![0.1, 0.9, 0.5])));
        let ranked = reranker
            .rerank("q", vec![candidate("a"), candidate("b"), candidate("c")], 2)
            .await;

        assert_eq!(ids(&ranked), vec!["b", "c"]);
        assert_eq!(ranked[0].rerank_score, Some(f64::from(0.9f32)));
    }

    #[tokio::test]
    async fn non_finite_scores_rank_last() {
        let reranker = Reranker::new(Arc::new(FixedScores(vec![f32::NAN, 0.2, f32::INFINITY, 0.5])));
        let ranked = reranker
            .rerank(
                "q",
                vec![candidate("a"), candidate("b"), candidate("c"), candidate("d")],
                4,
            )
            .await;

        assert_eq!(ids(&ranked), vec!["d", "b", "a", "c"]);
        assert_eq!(ranked[3].rerank_score, Some(f64::NEG_INFINITY));
    }

    #[tokio::test]
    async fn failing_encoder_keeps_original_order_unscored() {
        let reranker = Reranker::new(Arc::new(FailingEncoder));
        let ranked = reranker.rerank("q", vec![candidate("c1"), candidate("c2")], 1).await;

        assert_eq!(ids(&ranked), vec!["c1"]);
        assert_eq!(ranked[0].rerank_score, None);
    }

    #[tokio::test]
    async fn score_count_mismatch_is_treated_as_failure() {
        let reranker = Reranker::new(Arc::new(FixedScores(vec![0.3])));
        let ranked = reranker.rerank("q", vec![candidate("a"), candidate("b")], 5).await;

        assert_eq!(ids(&ranked), vec!["a", "b"]);
        assert!(ranked.iter().all(|candidate| candidate.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn empty_input_skips_the_encoder() {
        let reranker = Reranker::new(Arc::new(FailingEncoder));
        assert!(reranker.rerank("q", Vec::new(), 3).await.is_empty());
    }

    #[test]
    fn term_overlap_prefers_matching_passages() -> Result<(), RetrievalError> {
        let scores = TermOverlapCrossEncoder.score(
            "relief valve pressure",
            &["The relief valve opens at pressure".to_string(), "Pump wiring".to_string()],
        )?;
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[1], 0.0);
        Ok(())
    }

    #[test]
    fn endpoint_scores_are_restored_to_passage_order() -> Result<(), Box<dyn std::error::Error>> {
        let entries: Vec<RerankEntry> =
            serde_json::from_str(r#"[{"index": 1, "score": 0.8}, {"index": 0, "score": 0.2}]"#)?;
        assert_eq!(scores_by_index(entries, 2)?, vec![0.2, 0.8]);

        let partial: Vec<RerankEntry> = serde_json::from_str(r#"[{"index": 0, "score": 0.2}]"#)?;
        assert!(scores_by_index(partial, 2).is_err());
        Ok(())
    }

    #[test]
    fn http_encoder_reuses_one_client() -> Result<(), RetrievalError> {
        let encoder = HttpCrossEncoder::new(RerankEndpointConfig {
            endpoint: "http://127.0.0.1:9/rerank".to_string(),
            api_key: None,
            timeout: Duration::from_millis(200),
        })?;

        let first = encoder.client()? as *const Client;
        let second = encoder.client()? as *const Client;
        assert_eq!(first, second);
        Ok(())
    }

    proptest! {
        #[test]
        fn order_is_descending_and_stable(scores in prop::collection::vec(0u8..4, 1..20), top_n in 1usize..25) {
            let candidates = (0..scores.len()).map(|index| candidate(&index.to_string())).collect::<Vec<_>>();
            let scores = scores.into_iter().map(f32::from).collect::<Vec<_>>();

            let ranked = order_by_scores(candidates, &scores, top_n);

            prop_assert!(ranked.len() <= top_n);
            for pair in ranked.windows(2) {
                let (left, right) = (pair[0].rerank_score, pair[1].rerank_score);
                prop_assert!(left >= right);
                if left == right {
                    let left_index: usize = pair[0].id.parse().unwrap();
                    let right_index: usize = pair[1].id.parse().unwrap();
                    prop_assert!(left_index < right_index);
                }
            }
        }
    }
}
