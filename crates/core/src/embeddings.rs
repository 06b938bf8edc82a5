use crate::RetrievalError;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const DEFAULT: usize = 384;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Blocking embedding call. Run it through [`embed_off_thread`] from async code.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

pub async fn embed_off_thread(
    embedder: Arc<dyn Embedder>,
    text: &str,
) -> Result<Vec<f32>, RetrievalError> {
    let text = text.to_string();
    tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .map_err(|error| RetrievalError::Scoring(format!("embedding task failed: {error}")))?
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return Ok(vector);
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        Ok(vector)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: Vec<&'a str>,
    normalize: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Batch(Vec<Vec<f32>>),
    Wrapped { embeddings: Vec<Vec<f32>> },
}

/// Text-embeddings-inference style `/embed` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    config: EmbeddingEndpointConfig,
    client: OnceLock<Client>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingEndpointConfig) -> Result<Self, RetrievalError> {
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

impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut request = self
            .client()?
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&EmbedRequest {
                inputs: vec![text],
                normalize: true,
            });

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .map_err(|error| RetrievalError::Scoring(format!("embedding request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(RetrievalError::Scoring(format!(
                "embedding endpoint {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: EmbedResponse = response
            .json()
            .map_err(|error| RetrievalError::Scoring(format!("embedding response unreadable: {error}")))?;
        first_vector(payload, self.config.dimensions)
    }
}

fn first_vector(payload: EmbedResponse, dimensions: usize) -> Result<Vec<f32>, RetrievalError> {
    let vectors = match payload {
        EmbedResponse::Batch(vectors) => vectors,
        EmbedResponse::Wrapped { embeddings } => embeddings,
    };

    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::Scoring("embedding response was empty".to_string()))?;

    if vector.len() != dimensions {
        return Err(RetrievalError::Scoring(format!(
            "embedding dimension {} != {}",
            vector.len(),
            dimensions
        )));
    }

    Ok(vector)
}
