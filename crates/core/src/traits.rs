use crate::{Candidate, ComputationJob, JobError, PoolError, RetrievalError, SearchMode, SearchQuery};
use async_trait::async_trait;

/// A single retrieval source feeding fusion.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn mode(&self) -> SearchMode;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Candidate>, RetrievalError>;
}

/// Opens, probes and closes the raw connections held by a pool.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Cheap round-trip proving the connection still answers.
    async fn probe(&self, connection: &mut Self::Connection) -> Result<(), PoolError>;

    fn has_closed(&self, _connection: &mut Self::Connection) -> bool {
        false
    }

    async fn close(&self, connection: Self::Connection) {
        drop(connection);
    }
}

/// Nearest-neighbour lookup over a pooled connection.
#[async_trait]
pub trait VectorQuery: ManageConnection {
    async fn nearest(
        &self,
        connection: &mut Self::Connection,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Candidate>, RetrievalError>;
}

/// Post-response work executed by the computation worker.
#[async_trait]
pub trait Computation: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, job: &ComputationJob) -> Result<(), JobError>;
}
