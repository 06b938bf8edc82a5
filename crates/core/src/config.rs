use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_idle: usize,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub acquire_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    /// Connections older than this are retired before the server's idle disconnect hits them.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_refresh_threshold: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub maintenance_interval: Duration,
    pub maintenance_sample: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_idle: 1,
            max_retries: 3,
            acquire_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            idle_refresh_threshold: Duration::from_secs(270),
            maintenance_interval: Duration::from_secs(60),
            maintenance_sample: 2,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorRetryConfig {
    pub retry_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub query_timeout: Duration,
}

impl Default for VectorRetryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(250),
            query_timeout: Duration::from_secs(15),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    pub rerank_top: usize,
    pub min_graph_score: f64,
    /// How many graph hits lead the assembled context.
    pub graph_context_items: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retrieval_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub graph_request_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 10,
            rerank_top: 5,
            min_graph_score: 0.5,
            graph_context_items: 3,
            retrieval_timeout: Duration::from_secs(30),
            graph_request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub history_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { history_cap: 1_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub vector: VectorRetryConfig,
    pub retrieval: RetrievalConfig,
    pub queue: QueueConfig,
}

impl PipelineConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
