//! Embedding client for the bellman embedding service.
//!
//! The service exposes one endpoint, `POST /v1/embed`, taking a model FQN,
//! a task hint (`document` or `query`), and a list of input strings. This
//! module wraps it with:
//!
//! - a registry of known models and their token/dimension budgets,
//! - single-batch embedding with strict count checks,
//! - [`Embedder::embed_document`], which batches a whole document's chunks
//!   under the model's token budget while keeping one-vector-per-chunk
//!   output order (see [`batch`]).

mod batch;

pub use batch::ANCHOR_CHUNKS_PER_BATCH;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chars-per-token estimate used for the first batching pass.
const INITIAL_CHARS_PER_TOKEN: usize = 4;

/// Token budget assumed for models that do not declare one.
const DEFAULT_MAX_MODEL_TOKENS: usize = 32_000;

/// Errors raised by the embedding client.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The service was unreachable or the transport failed.
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with a non-success status.
    #[error("embedding service returned {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status of the failing response.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },
    /// A batch came back with the wrong number of embeddings.
    #[error("embedding count mismatch: sent {sent} inputs but received {received} embeddings")]
    CountMismatch {
        /// Inputs sent in the batch.
        sent: usize,
        /// Embeddings received back.
        received: usize,
    },
    /// A query embedding request produced no vector.
    #[error("no embedding returned")]
    EmptyResponse,
    /// Every chars-per-token estimate down to 1 still exceeded the model's
    /// token budget.
    #[error("could not embed document, all chunk batching attempts failed: {0}")]
    BatchingExhausted(String),
}

impl EmbedError {
    /// Whether the failure looks like a token-limit rejection, which the
    /// document batcher reacts to by shrinking its estimate.
    fn is_token_limit(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedStatus {
                status: StatusCode::BAD_REQUEST,
                ..
            }
        )
    }
}

/// An embedding model known to the service, identified by `provider/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedModel {
    /// Provider part of the FQN.
    pub provider: String,
    /// Model name part of the FQN.
    pub name: String,
    /// Input token budget per request.
    pub input_max_tokens: usize,
    /// Dimensionality of produced vectors.
    pub output_dimensions: usize,
}

/// Registered models: FQN, input token budget, output dimensions.
const MODEL_REGISTRY: &[(&str, usize, usize)] = &[
    ("voyageai/voyage-context-3", 32_000, 1024),
    ("voyageai/voyage-3", 32_000, 1024),
    ("voyageai/voyage-3-lite", 32_000, 512),
    ("voyageai/voyage-3-large", 32_000, 1024),
    ("openai/text-embedding-3-small", 8_191, 1536),
    ("openai/text-embedding-3-large", 8_191, 3072),
];

impl EmbedModel {
    /// Resolve a model from its fully qualified name.
    pub fn lookup(fqn: &str) -> Option<Self> {
        let entry = MODEL_REGISTRY.iter().find(|(name, _, _)| *name == fqn)?;
        let (provider, name) = entry.0.split_once('/')?;
        Some(Self {
            provider: provider.to_string(),
            name: name.to_string(),
            input_max_tokens: entry.1,
            output_dimensions: entry.2,
        })
    }

    /// The `provider/name` form used in tub settings and configuration.
    pub fn fqn(&self) -> String {
        format!("{}/{}", self.provider, self.name)
    }

    /// Token budget, substituting the default for models that declare none.
    fn token_budget(&self) -> usize {
        if self.input_max_tokens == 0 {
            DEFAULT_MAX_MODEL_TOKENS
        } else {
            self.input_max_tokens
        }
    }
}

/// Task hint forwarded to the embedding service.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedTask {
    /// Chunk text being indexed.
    Document,
    /// Search query text.
    Query,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: String,
    task: EmbedTask,
    inputs: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    metadata: EmbedResponseMetadata,
}

#[derive(Deserialize, Default)]
struct EmbedResponseMetadata {
    #[serde(default)]
    total_tokens: usize,
}

/// HTTP client for the embedding service.
pub struct Embedder {
    http: reqwest::Client,
    base_uri: String,
    name: String,
    key: String,
    default_model: EmbedModel,
}

impl Embedder {
    /// Build a client for the configured service.
    pub fn new(base_uri: &str, name: &str, key: &str, default_model: EmbedModel) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_uri: base_uri.trim_end_matches('/').to_string(),
            name: name.to_string(),
            key: key.to_string(),
            default_model,
        }
    }

    /// The model used when a tub does not configure one.
    pub fn default_model(&self) -> &EmbedModel {
        &self.default_model
    }

    /// Resolve a tub's `embed_model` setting, falling back to the default
    /// model when the setting is absent or names an unknown model.
    pub fn model_or_default(&self, fqn: Option<&str>) -> EmbedModel {
        match fqn {
            Some(fqn) => EmbedModel::lookup(fqn).unwrap_or_else(|| {
                tracing::warn!(model = fqn, "Unknown embed model in tub settings, using default");
                self.default_model.clone()
            }),
            None => self.default_model.clone(),
        }
    }

    async fn embed_batch(
        &self,
        model: &EmbedModel,
        task: EmbedTask,
        inputs: &[String],
    ) -> Result<EmbedResponse, EmbedError> {
        let request = EmbedRequest {
            model: model.fqn(),
            task,
            inputs,
        };
        let response = self
            .http
            .post(format!("{}/v1/embed", self.base_uri))
            .bearer_auth(format!("{}_{}", self.name, self.key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::UnexpectedStatus { status, body });
        }
        Ok(response.json().await?)
    }

    /// Embed a batch of chunk texts as-is, one vector per input.
    pub async fn embed_chunks(
        &self,
        model: &EmbedModel,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self.embed_batch(model, EmbedTask::Document, texts).await?;
        if response.embeddings.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                sent: texts.len(),
                received: response.embeddings.len(),
            });
        }
        Ok(response.embeddings)
    }

    /// Embed a search query into a single vector.
    pub async fn embed_query(
        &self,
        model: &EmbedModel,
        query: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        let inputs = [query.to_string()];
        let mut response = self.embed_batch(model, EmbedTask::Query, &inputs).await?;
        match response.embeddings.pop() {
            Some(vector) => Ok(vector),
            None => Err(EmbedError::EmptyResponse),
        }
    }

    /// Embed an ordered document, producing exactly one vector per chunk.
    ///
    /// Chunks are grouped into batches under the model's token budget using
    /// a chars-per-token estimate that starts at 4. Batches after the first
    /// are given up to [`ANCHOR_CHUNKS_PER_BATCH`] anchor chunks from the
    /// start of the document for context; their embeddings are discarded
    /// before assembly. A token-limit rejection (HTTP 400) shrinks the
    /// estimate by one and restarts the whole pass, down to 1.
    pub async fn embed_document(
        &self,
        model: &EmbedModel,
        chunks: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let total_chars: usize = chunks.iter().map(|c| c.len()).sum();
        let budget = model.token_budget();

        let mut chars_per_token = INITIAL_CHARS_PER_TOKEN;
        let mut last_error = String::new();

        while chars_per_token >= 1 {
            let plan = batch::plan_batches(budget, chunks, chars_per_token);
            let mut result: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
            let mut total_tokens = 0usize;
            let mut shrink = false;

            for (index, planned) in plan.iter().enumerate() {
                let response = match self
                    .embed_batch(model, EmbedTask::Document, &planned.inputs)
                    .await
                {
                    Ok(response) => response,
                    Err(err) if err.is_token_limit() => {
                        tracing::warn!(
                            batch_index = index,
                            batch_size = planned.inputs.len(),
                            chars_per_token,
                            error = %err,
                            "Embedding batch rejected, retrying with smaller batches"
                        );
                        last_error = err.to_string();
                        shrink = true;
                        break;
                    }
                    Err(err) => return Err(err),
                };

                let embeddings = response.embeddings;
                if embeddings.len() != planned.inputs.len() {
                    return Err(EmbedError::CountMismatch {
                        sent: planned.inputs.len(),
                        received: embeddings.len(),
                    });
                }
                total_tokens += response.metadata.total_tokens;
                tracing::info!(
                    batch_index = index,
                    batch_size = planned.inputs.len(),
                    tokens = response.metadata.total_tokens,
                    "Embedded document chunk batch"
                );
                result.extend(embeddings.into_iter().skip(planned.anchor_count));
            }

            if shrink {
                chars_per_token -= 1;
                continue;
            }
            if result.len() != chunks.len() {
                return Err(EmbedError::CountMismatch {
                    sent: chunks.len(),
                    received: result.len(),
                });
            }
            tracing::info!(
                total_chunks = chunks.len(),
                total_tokens,
                total_characters = total_chars,
                used_chars_per_token_estimate = chars_per_token,
                "Successfully embedded document"
            );
            return Ok(result);
        }

        Err(EmbedError::BatchingExhausted(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn model() -> EmbedModel {
        EmbedModel::lookup("voyageai/voyage-context-3").unwrap()
    }

    fn embedder(server: &MockServer) -> Embedder {
        Embedder::new(&server.base_url(), "ragnar", "secret", model())
    }

    #[test]
    fn registry_resolves_known_models() {
        let m = model();
        assert_eq!(m.provider, "voyageai");
        assert_eq!(m.name, "voyage-context-3");
        assert_eq!(m.output_dimensions, 1024);
        assert_eq!(m.fqn(), "voyageai/voyage-context-3");
        assert!(EmbedModel::lookup("acme/unknown").is_none());
    }

    #[test]
    fn unknown_tub_model_falls_back_to_default() {
        let server = MockServer::start();
        let embedder = embedder(&server);
        assert_eq!(embedder.model_or_default(None), model());
        assert_eq!(embedder.model_or_default(Some("acme/unknown")), model());
        assert_eq!(
            embedder.model_or_default(Some("openai/text-embedding-3-small")).fqn(),
            "openai/text-embedding-3-small"
        );
    }

    #[tokio::test]
    async fn embed_query_returns_single_vector() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/embed")
                .header("authorization", "Bearer ragnar_secret")
                .json_body_partial(r#"{"task": "query"}"#);
            then.status(200)
                .json_body(serde_json::json!({"embeddings": [[0.1, 0.2]], "metadata": {"total_tokens": 3}}));
        });

        let vector = embedder(&server)
            .embed_query(&model(), "what is ragnar")
            .await
            .unwrap();
        mock.assert();
        assert_eq!(vector, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn embed_query_rejects_empty_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embed");
            then.status(200).json_body(serde_json::json!({"embeddings": []}));
        });

        let err = embedder(&server).embed_query(&model(), "q").await.unwrap_err();
        assert!(matches!(err, EmbedError::EmptyResponse));
    }

    #[tokio::test]
    async fn embed_chunks_checks_count() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embed");
            then.status(200)
                .json_body(serde_json::json!({"embeddings": [[0.1]]}));
        });

        let err = embedder(&server)
            .embed_chunks(&model(), &["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::CountMismatch { sent: 2, received: 1 }));
    }

    #[tokio::test]
    async fn embed_document_single_batch_roundtrip() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/embed");
            then.status(200).json_body(serde_json::json!({
                "embeddings": [[1.0], [2.0], [3.0]],
                "metadata": {"total_tokens": 9}
            }));
        });

        let chunks = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let vectors = embedder(&server).embed_document(&model(), &chunks).await.unwrap();
        mock.assert();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[tokio::test]
    async fn embed_document_exhausts_on_persistent_400() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/embed");
            then.status(400).body("context length exceeded");
        });

        let chunks = vec!["chunk".to_string()];
        let err = embedder(&server).embed_document(&model(), &chunks).await.unwrap_err();
        // One request per chars-per-token estimate: 4, 3, 2, 1.
        mock.assert_hits(4);
        assert!(matches!(err, EmbedError::BatchingExhausted(_)));
    }

    #[tokio::test]
    async fn embed_document_propagates_server_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embed");
            then.status(503).body("down");
        });

        let err = embedder(&server)
            .embed_document(&model(), &["x".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EmbedError::UnexpectedStatus { status: StatusCode::SERVICE_UNAVAILABLE, .. }
        ));
    }

    #[tokio::test]
    async fn embed_document_empty_input_is_noop() {
        let server = MockServer::start();
        let vectors = embedder(&server).embed_document(&model(), &[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
