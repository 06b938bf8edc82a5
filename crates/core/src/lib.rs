pub mod computations;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod fusion;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod rerank;
pub mod stores;
pub mod traits;

pub use computations::{ComputationChain, JsonLinesRecorder, RetrievalStatsLogger};
pub use config::{PipelineConfig, PoolConfig, QueueConfig, RetrievalConfig, VectorRetryConfig};
pub use context::ContextAssembler;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingEndpointConfig, HttpEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{JobError, PoolError, RetrievalError};
pub use fusion::fuse;
pub use models::{
    content_hash, Candidate, CandidateMetadata, ComputationJob, FusionResult, JobPayload,
    JobState, JobStatus, RetrievalRequest, RetrievedContext, SearchMode, SearchQuery,
};
pub use orchestrator::HybridRetriever;
pub use pool::{ConnectionHandle, ConnectionPoolManager, PoolStatus};
pub use queue::ComputationQueue;
pub use rerank::{
    CrossEncoder, HttpCrossEncoder, RerankEndpointConfig, Reranker, TermOverlapCrossEncoder,
};
pub use stores::{GraphSearchClient, Neo4jConfig, PgVectorManager, VectorSearchClient};
pub use traits::{Computation, ManageConnection, Retriever, VectorQuery};
