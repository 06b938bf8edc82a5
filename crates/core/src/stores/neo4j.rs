use crate::models::content_hash;
use crate::traits::Retriever;
use crate::{Candidate, CandidateMetadata, RetrievalError, SearchMode, SearchQuery};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND: &str = "neo4j";

const FULLTEXT_QUERY: &str = r#"
    CALL db.index.fulltext.queryNodes($index, $query) YIELD node, score
    WHERE score >= $min_score
    RETURN coalesce(node.hash, '') AS hash,
           coalesce(node.title, '') AS title,
           coalesce(node.content, node.text, '') AS content,
           score,
           coalesce(node.document_title, '') AS document_title,
           coalesce(node.chapter_title, '') AS chapter_title,
           coalesce(node.section_title, '') AS section_title,
           coalesce(node.source_path, '') AS source_path
    ORDER BY score DESC
    LIMIT $limit
"#;

#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub fulltext_index: String,
    pub request_timeout: Duration,
    pub default_min_score: f64,
}

/// Full-text search over the graph store's HTTP transaction endpoint.
///
/// The HTTP session is probed before every search and rebuilt once when the probe fails.
pub struct GraphSearchClient {
    config: Neo4jConfig,
    session: RwLock<Client>,
    refreshes: AtomicU64,
}

impl GraphSearchClient {
    pub fn new(config: Neo4jConfig) -> Result<Self, RetrievalError> {
        url::Url::parse(&config.endpoint)?;
        let session = build_session(config.request_timeout)?;
        Ok(Self {
            config,
            session: RwLock::new(session),
            refreshes: AtomicU64::new(0),
        })
    }

    /// How many times the HTTP session has been rebuilt after a failed probe.
    pub fn session_refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn tx_url(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.config.endpoint.trim_end_matches('/'),
            self.config.database
        )
    }

    fn current_session(&self) -> Client {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run(&self, session: &Client, statement: &str, parameters: Value) -> Result<Value, RetrievalError> {
        let response = session
            .post(self.tx_url())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&json!({
                "statements": [
                    {
                        "statement": statement,
                        "parameters": parameters
                    }
                ]
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RetrievalError::connection(BACKEND, status));
        }
        if !status.is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: BACKEND.to_string(),
                details: status.to_string(),
            });
        }

        let body: Value = response.json().await?;
        if let Some(message) = first_error(&body) {
            return Err(RetrievalError::Query {
                backend: BACKEND.to_string(),
                details: message,
            });
        }
        Ok(body)
    }

    async fn probe(&self, session: &Client) -> Result<(), RetrievalError> {
        self.run(session, "RETURN 1 AS ok", json!({})).await.map(|_| ())
    }

    /// Returns a session that just answered a probe, rebuilding it once if needed.
    pub async fn ensure_session(&self) -> Result<Client, RetrievalError> {
        let session = self.current_session();
        match self.probe(&session).await {
            Ok(()) => return Ok(session),
            Err(error) => warn!(error = %error, "neo4j session failed its probe, reconnecting"),
        }

        let fresh = build_session(self.config.request_timeout)?;
        self.probe(&fresh)
            .await
            .map_err(|error| RetrievalError::connection(BACKEND, format!("still unhealthy after refresh: {error}")))?;

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(endpoint = %self.config.endpoint, "neo4j session refreshed");
        Ok(fresh)
    }

    pub async fn search_fulltext(
        &self,
        text: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let session = self.ensure_session().await?;
        let body = self
            .run(
                &session,
                FULLTEXT_QUERY,
                json!({
                    "index": self.config.fulltext_index,
                    "query": escape_lucene(text),
                    "min_score": min_score,
                    "limit": limit,
                }),
            )
            .await?;

        let hits = extract_rows(&body)
            .into_iter()
            .filter_map(|row| row.as_array().and_then(|values| row_to_candidate(values)))
            .collect::<Vec<_>>();

        debug!(hits = hits.len(), min_score, "graph full-text search finished");
        Ok(hits)
    }
}

#[async_trait]
impl Retriever for GraphSearchClient {
    fn mode(&self) -> SearchMode {
        SearchMode::Graph
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Candidate>, RetrievalError> {
        let min_score = query.min_score.unwrap_or(self.config.default_min_score);
        self.search_fulltext(&query.text, min_score, query.k).await
    }
}

fn build_session(timeout: Duration) -> Result<Client, RetrievalError> {
    Ok(Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?)
}

fn first_error(payload: &Value) -> Option<String> {
    payload
        .pointer("/errors/0")
        .map(|error| {
            let code = error.pointer("/code").and_then(Value::as_str).unwrap_or_default();
            let message = error.pointer("/message").and_then(Value::as_str).unwrap_or_default();
            format!("{code}: {message}")
        })
}

/// Escapes Lucene query syntax so user text is matched literally.
pub fn escape_lucene(text: &str) -> String {
    const SPECIAL: &[char] = &[
        '+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':', '\\', '/',
    ];
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        if SPECIAL.contains(&character) {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

fn row_to_candidate(values: &[Value]) -> Option<Candidate> {
    if values.len() < 4 {
        return None;
    }

    let text = |index: usize| {
        values
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let content = text(2);
    if content.trim().is_empty() {
        return None;
    }

    let hash = text(0);
    let source_hash = if hash.is_empty() { content_hash(&content) } else { hash };
    let title = text(1);
    let section_title = match text(6) {
        section if section.is_empty() => title,
        section => section,
    };

    Some(Candidate {
        id: source_hash.clone(),
        score: values.get(3).and_then(Value::as_f64).unwrap_or(0.0),
        source_hash,
        metadata: CandidateMetadata {
            document_title: text(4),
            chapter_title: text(5),
            section_title,
            source_path: text(7),
        },
        content,
        origin: SearchMode::Graph,
        rerank_score: None,
    })
}

fn extract_rows(payload: &Value) -> Vec<&Value> {
    let data = payload.pointer("/results").and_then(Value::as_array);
    match data {
        Some(results) => results
            .iter()
            .filter_map(|result| result.pointer("/data").and_then(Value::as_array))
            .flat_map(|result_rows| result_rows.iter().filter_map(row_of))
            .collect(),
        None => payload
            .pointer("/data")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(row_of).collect())
            .unwrap_or_default(),
    }
}

fn row_of(entry: &Value) -> Option<&Value> {
    entry
        .pointer("/row")
        .or(Some(entry))
        .filter(|candidate| candidate.is_array())
}
