use crate::{Candidate, FusionResult};
use std::collections::HashSet;
use tracing::debug;

/// Keeps vector hits whose identity hash was also surfaced by the graph store.
///
/// When nothing overlaps, the unfiltered vector hits (bounded to `k`) are returned so
/// the caller still gets an answerable context. `graph_hit_count` always reports how
/// many graph hits came in, whichever branch was taken.
pub fn fuse(graph_hits: &[Candidate], vector_hits: &[Candidate], k: usize) -> FusionResult {
    let graph_hashes = graph_hits
        .iter()
        .map(|hit| hit.source_hash.as_str())
        .filter(|hash| !hash.is_empty())
        .collect::<HashSet<_>>();

    let mut candidates = vector_hits
        .iter()
        .filter(|hit| graph_hashes.contains(hit.source_hash.as_str()))
        .take(k)
        .cloned()
        .collect::<Vec<_>>();

    if candidates.is_empty() {
        debug!(
            graph_hits = graph_hits.len(),
            vector_hits = vector_hits.len(),
            "no graph/vector overlap, falling back to vector hits"
        );
        candidates = vector_hits.iter().take(k).cloned().collect();
    }

    FusionResult {
        candidates,
        graph_hit_count: graph_hits.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::fuse;
    use crate::{Candidate, CandidateMetadata, SearchMode};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn hit(id: &str, hash: &str, origin: SearchMode) -> Candidate {
        Candidate {
            id: id.to_string(),
            content: format!("content of {id}"),
            score: 0.5,
            source_hash: hash.to_string(),
            metadata: CandidateMetadata::default(),
            origin,
            rerank_score: None,
        }
    }

    fn graph(hash: &str) -> Candidate {
        hit(&format!("g-{hash}"), hash, SearchMode::Graph)
    }

    fn vector(hash: &str) -> Candidate {
        hit(&format!("v-{hash}"), hash, SearchMode::Vector)
    }

    #[test]
    fn keeps_only_vector_hits_seen_by_graph() {
        let graph_hits = vec![graph("h1"), graph("h2")];
        let vector_hits = vec![vector("h1"), vector("h3")];

        let fused = fuse(&graph_hits, &vector_hits, 10);

        let hashes = fused
            .candidates
            .iter()
            .map(|candidate| candidate.source_hash.as_str())
            .collect::<Vec<_>>();
        assert_eq!(hashes, vec!["h1"]);
        assert_eq!(fused.graph_hit_count, 2);
    }

    #[test]
    fn empty_graph_falls_back_to_bounded_vector_hits() {
        let vector_hits = vec![vector("v1"), vector("v2")];

        let fused = fuse(&[], &vector_hits, 1);

        assert_eq!(fused.candidates, vec![vector("v1")]);
        assert_eq!(fused.graph_hit_count, 0);
    }

    #[test]
    fn disjoint_sources_fall_back_but_still_count_graph_hits() {
        let graph_hits = vec![graph("a"), graph("b"), graph("c")];
        let vector_hits = vec![vector("x"), vector("y")];

        let fused = fuse(&graph_hits, &vector_hits, 5);

        assert_eq!(fused.candidates, vector_hits);
        assert_eq!(fused.graph_hit_count, 3);
    }

    #[test]
    fn duplicate_graph_hashes_still_count_every_hit() {
        let graph_hits = vec![graph("h1"), graph("h1")];
        let fused = fuse(&graph_hits, &[vector("h1")], 5);

        assert_eq!(fused.candidates.len(), 1);
        assert_eq!(fused.graph_hit_count, 2);
    }

    fn hashes() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("h[0-9]", 0..12)
    }

    proptest! {
        #[test]
        fn fused_hashes_come_from_graph_unless_falling_back(
            graph_hashes in hashes(),
            vector_hashes in hashes(),
            k in 1usize..8,
        ) {
            let graph_hits = graph_hashes.iter().map(|hash| graph(hash)).collect::<Vec<_>>();
            let vector_hits = vector_hashes.iter().map(|hash| vector(hash)).collect::<Vec<_>>();
            let graph_set = graph_hashes.iter().cloned().collect::<HashSet<_>>();

            let fused = fuse(&graph_hits, &vector_hits, k);

            prop_assert_eq!(fused.graph_hit_count, graph_hits.len());
            prop_assert!(fused.candidates.len() <= k);

            let overlap = vector_hashes.iter().any(|hash| graph_set.contains(hash));
            if overlap {
                prop_assert!(fused
                    .candidates
                    .iter()
                    .all(|candidate| graph_set.contains(&candidate.source_hash)));
            } else {
                let expected = vector_hits.iter().take(k).cloned().collect::<Vec<_>>();
                prop_assert_eq!(fused.candidates, expected);
            }
        }
    }
}
