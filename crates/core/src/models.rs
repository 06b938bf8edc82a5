use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SearchMode {
    Graph,
    Vector,
}

impl SearchMode {
    pub fn tag(self) -> &'static str {
        match self {
            SearchMode::Graph => "graph",
            SearchMode::Vector => "vector",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateMetadata {
    pub document_title: String,
    pub chapter_title: String,
    pub section_title: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub source_hash: String,
    pub metadata: CandidateMetadata,
    pub origin: SearchMode,
    pub rerank_score: Option<f64>,
}

impl Candidate {
    /// Key used to correlate the same fragment across stores.
    pub fn identity_key(&self) -> &str {
        if self.source_hash.is_empty() {
            &self.id
        } else {
            &self.source_hash
        }
    }

    pub fn with_rerank_score(&self, score: f64) -> Self {
        Self {
            rerank_score: Some(score),
            ..self.clone()
        }
    }

    pub fn title(&self) -> &str {
        let metadata = &self.metadata;
        [
            metadata.section_title.as_str(),
            metadata.chapter_title.as_str(),
            metadata.document_title.as_str(),
        ]
        .into_iter()
        .find(|title| !title.is_empty())
        .unwrap_or_default()
    }
}

/// SHA-256 of normalized content, used when a store row carries no identity hash.
pub fn content_hash(content: &str) -> String {
    let normalized = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FusionResult {
    pub candidates: Vec<Candidate>,
    pub graph_hit_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub k: usize,
    pub min_score: Option<f64>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            min_score: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalRequest {
    pub query: String,
    pub k: usize,
    pub rerank_top: usize,
    pub min_graph_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievedContext {
    pub context: String,
    pub documents: Vec<Candidate>,
    pub node_count: usize,
}

impl RetrievedContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.documents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Errored,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub query: String,
    pub draft_answer: Option<String>,
    pub context: String,
    pub documents: Vec<Candidate>,
    pub node_count: usize,
}

impl JobPayload {
    pub fn from_retrieval(query: impl Into<String>, retrieved: &RetrievedContext) -> Self {
        Self {
            query: query.into(),
            draft_answer: None,
            context: retrieved.context.clone(),
            documents: retrieved.documents.clone(),
            node_count: retrieved.node_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputationJob {
    pub job_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub state: JobState,
}

impl ComputationJob {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            payload,
            state: JobState::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
