use crate::{Candidate, RetrievedContext};
use std::collections::HashSet;

pub struct ContextAssembler {
    graph_items: usize,
}

impl ContextAssembler {
    pub fn new(graph_items: usize) -> Self {
        Self { graph_items }
    }

    /// Leading graph hits, then reranked vector hits, each fragment once.
    ///
    /// `node_count` is passed through from fusion; it is not the number of documents.
    pub fn assemble(
        &self,
        top_graph: &[Candidate],
        reranked: &[Candidate],
        node_count: usize,
    ) -> RetrievedContext {
        let mut seen = HashSet::new();
        let mut sections = Vec::new();
        let mut documents = Vec::new();

        let selected = top_graph
            .iter()
            .take(self.graph_items)
            .chain(reranked.iter());

        for candidate in selected {
            if !seen.insert(candidate.identity_key().to_string()) {
                continue;
            }
            sections.push(render(candidate));
            documents.push(candidate.clone());
        }

        RetrievedContext {
            context: sections.join("\n\n"),
            documents,
            node_count,
        }
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(3)
    }
}

fn render(candidate: &Candidate) -> String {
    let title = candidate.title();
    if title.is_empty() {
        format!("[{}] {}", candidate.origin.tag(), candidate.content.trim())
    } else {
        format!(
            "[{}] {}\n{}",
            candidate.origin.tag(),
            title,
            candidate.content.trim()
        )
    }
}
