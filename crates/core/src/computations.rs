use crate::traits::Computation;
use crate::{ComputationJob, JobError, SearchMode};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Runs every stage in order. All stages run even when an earlier one fails; the first
/// failure is the one reported.
#[derive(Default)]
pub struct ComputationChain {
    stages: Vec<Arc<dyn Computation>>,
}

impl ComputationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn Computation>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl Computation for ComputationChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn run(&self, job: &ComputationJob) -> Result<(), JobError> {
        let mut first_failure = None;
        for stage in &self.stages {
            if let Err(error) = stage.run(job).await {
                warn!(job_id = %job.job_id, stage = stage.name(), error = %error, "computation stage failed");
                first_failure.get_or_insert(error);
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Appends one JSON object per finished retrieval to an audit file.
pub struct JsonLinesRecorder {
    path: PathBuf,
}

impl JsonLinesRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Computation for JsonLinesRecorder {
    fn name(&self) -> &str {
        "jsonl-recorder"
    }

    async fn run(&self, job: &ComputationJob) -> Result<(), JobError> {
        let documents = job
            .payload
            .documents
            .iter()
            .map(|doc| {
                json!({
                    "source_hash": doc.source_hash,
                    "origin": doc.origin.tag(),
                    "score": doc.score,
                    "rerank_score": doc.rerank_score,
                    "title": doc.title(),
                })
            })
            .collect::<Vec<_>>();

        let record = json!({
            "job_id": job.job_id,
            "enqueued_at": job.enqueued_at,
            "query": job.payload.query,
            "draft_answer": job.payload.draft_answer,
            "node_count": job.payload.node_count,
            "context_chars": job.payload.context.chars().count(),
            "documents": documents,
        });
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Emits a structured log line describing the retrieval behind a job.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetrievalStatsLogger;

#[async_trait]
impl Computation for RetrievalStatsLogger {
    fn name(&self) -> &str {
        "retrieval-stats"
    }

    async fn run(&self, job: &ComputationJob) -> Result<(), JobError> {
        let graph_documents = job
            .payload
            .documents
            .iter()
            .filter(|doc| doc.origin == SearchMode::Graph)
            .count();
        let reranked = job
            .payload
            .documents
            .iter()
            .filter(|doc| doc.rerank_score.is_some())
            .count();
        let hashes = job
            .payload
            .documents
            .iter()
            .map(|doc| doc.identity_key())
            .collect::<Vec<_>>()
            .join(",");

        info!(
            job_id = %job.job_id,
            query = %job.payload.query,
            documents = job.payload.documents.len(),
            graph_documents,
            reranked,
            node_count = job.payload.node_count,
            context_chars = job.payload.context.chars().count(),
            hashes = %hashes,
            answered = job.payload.draft_answer.is_some(),
            "retrieval stats"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Candidate, CandidateMetadata, JobPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl Counting {
        fn new(fail_with: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl Computation for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _job: &ComputationJob) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(message) => Err(JobError::Computation(message.to_string())),
                None => Ok(()),
            }
        }
    }

    fn job() -> ComputationJob {
        ComputationJob::new(JobPayload {
            query: "relief valve pressure".to_string(),
            draft_answer: Some("Set it to 8 bar.".to_string()),
            context: "[graph] Valves\nRelief valve setting".to_string(),
            documents: vec![Candidate {
                id: "h1".to_string(),
                content: "Relief valve setting".to_string(),
                score: 2.0,
                source_hash: "h1".to_string(),
                metadata: CandidateMetadata {
                    section_title: "Valves".to_string(),
                    ..CandidateMetadata::default()
                },
                origin: SearchMode::Graph,
                rerank_score: Some(0.8),
            }],
            node_count: 1,
        })
    }

    #[tokio::test]
    async fn chain_runs_every_stage_and_reports_first_failure() {
        let first = Counting::new(Some("first"));
        let second = Counting::new(Some("second"));
        let third = Counting::new(None);
        let chain = ComputationChain::new()
            .with_stage(first.clone())
            .with_stage(second.clone())
            .with_stage(third.clone());

        let error = chain.run(&job()).await.unwrap_err();

        assert!(error.to_string().contains("first"));
        assert_eq!(chain.len(), 3);
        for stage in [&first, &second, &third] {
            assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn empty_chain_succeeds() {
        let chain = ComputationChain::new();
        assert!(chain.is_empty());
        assert!(chain.run(&job()).await.is_ok());
    }

    #[tokio::test]
    async fn recorder_appends_one_line_per_job() -> Result<(), JobError> {
        let dir = tempfile::tempdir()?;
        let recorder = JsonLinesRecorder::new(dir.path().join("audit.jsonl"));
        let first = job();

        recorder.run(&first).await?;
        recorder.run(&job()).await?;

        let written = tokio::fs::read_to_string(recorder.path()).await?;
        let lines = written.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);

        let record: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(record["job_id"], json!(first.job_id));
        assert_eq!(record["query"], "relief valve pressure");
        assert_eq!(record["documents"][0]["origin"], "graph");
        assert_eq!(record["documents"][0]["title"], "Valves");
        Ok(())
    }

    #[tokio::test]
    async fn recorder_surfaces_io_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = JsonLinesRecorder::new(dir.path().join("missing").join("audit.jsonl"));

        assert!(matches!(recorder.run(&job()).await, Err(JobError::Io(_))));
    }

    #[tokio::test]
    async fn stats_logger_never_fails() {
        assert!(RetrievalStatsLogger.run(&job()).await.is_ok());
    }
}
