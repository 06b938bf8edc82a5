use crate::config::VectorRetryConfig;
use crate::embeddings::{embed_off_thread, Embedder};
use crate::pool::ConnectionPoolManager;
use crate::models::content_hash;
use crate::traits::{ManageConnection, Retriever, VectorQuery};
use crate::{Candidate, CandidateMetadata, PoolError, RetrievalError, SearchMode, SearchQuery};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

const BACKEND: &str = "pgvector";

/// Opens Postgres connections and runs cosine-distance lookups against a pgvector table.
pub struct PgVectorManager {
    database_url: String,
    nearest_sql: String,
}

impl PgVectorManager {
    pub fn new(database_url: impl Into<String>, table: &str) -> Result<Self, RetrievalError> {
        validate_identifier(table)?;
        Ok(Self {
            database_url: database_url.into(),
            nearest_sql: nearest_sql(table),
        })
    }
}

fn nearest_sql(table: &str) -> String {
    format!(
        "SELECT id::text AS id, \
                coalesce(content, '') AS content, \
                coalesce(source_hash, '') AS source_hash, \
                coalesce(document_title, '') AS document_title, \
                coalesce(chapter_title, '') AS chapter_title, \
                coalesce(section_title, '') AS section_title, \
                coalesce(source_path, '') AS source_path, \
                (embedding <=> $1::vector) AS distance \
         FROM {table} \
         ORDER BY embedding <=> $1::vector \
         LIMIT $2"
    )
}

fn validate_identifier(table: &str) -> Result<(), RetrievalError> {
    let valid = !table.is_empty()
        && table.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
                && chars.all(|rest| rest.is_ascii_alphanumeric() || rest == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(RetrievalError::Request(format!("invalid table name: {table}")))
    }
}

fn vector_literal(embedding: &[f32]) -> String {
    let values = embedding
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{values}]")
}

fn classify(error: sqlx::Error) -> RetrievalError {
    let connection_class = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // 08xxx connection exceptions, 57P0x admin/crash shutdown
        sqlx::Error::Database(database) => database
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    };

    if connection_class {
        RetrievalError::connection(BACKEND, error)
    } else {
        RetrievalError::Query {
            backend: BACKEND.to_string(),
            details: error.to_string(),
        }
    }
}

fn read_row(row: &PgRow) -> Result<Option<Candidate>, RetrievalError> {
    let text = |column: &str| row.try_get::<String, _>(column).map_err(classify);
    let distance = row.try_get::<f64, _>("distance").map_err(classify)?;
    let metadata = CandidateMetadata {
        document_title: text("document_title")?,
        chapter_title: text("chapter_title")?,
        section_title: text("section_title")?,
        source_path: text("source_path")?,
    };

    Ok(to_candidate(
        text("id")?,
        text("content")?,
        text("source_hash")?,
        metadata,
        distance,
    ))
}

/// Rows without content are skipped; a missing hash is derived from the content so the
/// fragment still lines up with the graph store's rows.
fn to_candidate(
    id: String,
    content: String,
    source_hash: String,
    metadata: CandidateMetadata,
    distance: f64,
) -> Option<Candidate> {
    if content.trim().is_empty() {
        return None;
    }

    let source_hash = if source_hash.trim().is_empty() {
        content_hash(&content)
    } else {
        source_hash
    };

    Some(Candidate {
        id,
        content,
        score: 1.0 - distance,
        source_hash,
        metadata,
        origin: SearchMode::Vector,
        rerank_score: None,
    })
}

#[async_trait]
impl ManageConnection for PgVectorManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, PoolError> {
        PgConnection::connect(&self.database_url)
            .await
            .map_err(|error| PoolError::Connect(error.to_string()))
    }

    async fn probe(&self, connection: &mut PgConnection) -> Result<(), PoolError> {
        sqlx::query("SELECT 1")
            .execute(&mut *connection)
            .await
            .map(|_| ())
            .map_err(|error| PoolError::Probe(error.to_string()))
    }

    async fn close(&self, connection: PgConnection) {
        if let Err(error) = connection.close().await {
            debug!(error = %error, "postgres connection did not close cleanly");
        }
    }
}

#[async_trait]
impl VectorQuery for PgVectorManager {
    async fn nearest(
        &self,
        connection: &mut PgConnection,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let rows = sqlx::query(&self.nearest_sql)
            .bind(vector_literal(embedding))
            .bind(k as i64)
            .fetch_all(&mut *connection)
            .await
            .map_err(classify)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(hit) = read_row(row)? {
                hits.push(hit);
            }
        }
        Ok(hits)
    }
}

/// Nearest-neighbour retrieval over pooled connections with bounded retries.
pub struct VectorSearchClient<M: VectorQuery> {
    pool: Arc<ConnectionPoolManager<M>>,
    embedder: Arc<dyn Embedder>,
    retry: VectorRetryConfig,
}

impl<M: VectorQuery> VectorSearchClient<M> {
    pub fn new(
        pool: Arc<ConnectionPoolManager<M>>,
        embedder: Arc<dyn Embedder>,
        retry: VectorRetryConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            retry,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager<M>> {
        &self.pool
    }

    /// Connection-class failures drop the handle as broken and retry with a growing
    /// delay; any other failure is returned straight away.
    pub async fn nearest_neighbors(&self, text: &str, k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let embedding = embed_off_thread(Arc::clone(&self.embedder), text).await?;
        let attempts = self.retry.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut handle = self.pool.acquire().await?;
            let lookup = self.pool.manager().nearest(&mut *handle, &embedding, k);
            let outcome = match timeout(self.retry.query_timeout, lookup).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RetrievalError::connection(
                    BACKEND,
                    format!("query timed out after {:?}", self.retry.query_timeout),
                )),
            };

            match outcome {
                Ok(hits) => {
                    self.pool.release(handle);
                    debug!(hits = hits.len(), attempt, "vector search finished");
                    return Ok(hits);
                }
                Err(error) if error.is_connection_class() => {
                    handle.mark_broken();
                    self.pool.release(handle);
                    warn!(attempt, attempts, error = %error, "vector search hit a connection error");
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.retry_delay * attempt).await;
                    }
                }
                Err(error) => {
                    self.pool.release(handle);
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RetrievalError::connection(BACKEND, "no attempt made")))
    }
}

#[async_trait]
impl<M: VectorQuery> Retriever for VectorSearchClient<M> {
    fn mode(&self) -> SearchMode {
        SearchMode::Vector
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Candidate>, RetrievalError> {
        self.nearest_neighbors(&query.text, query.k).await
    }
}
