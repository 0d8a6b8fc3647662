//! Ingestion pipeline: convert → chunk → embed.
//!
//! Each stage is a named handler registered on the task queue. A stage runs
//! under an at-least-once claim, so every handler is idempotent on re-run:
//! conversion compares Markdown hashes, chunking compares chunk content,
//! and embedding overwrites by `(document_id, chunk_id)`.
//!
//! Scheduling keys tasks by the document's uuid. Re-uploading a document
//! while a stage is still pending deletes the pending task and re-inserts,
//! so the most recent request wins; an in-flight claim is not aborted.

mod chunk;
mod convert;
mod embed;

use crate::blob::{BlobError, BlobStore};
use crate::chunker::ChunkerError;
use crate::convert::ConvertError;
use crate::embedding::{EmbedError, Embedder};
use crate::model::{Document, DocumentStatus, Status};
use crate::queue::{QueueError, Task, TaskQueue};
use crate::store::{MetaStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Stage name for document-to-Markdown conversion.
pub const TASK_DOCUMENT_CONVERSION: &str = "document-conversion";
/// Stage name for Markdown chunking.
pub const TASK_CHUNK_DOCUMENT: &str = "chunk-document";
/// Stage name for chunk embedding.
pub const TASK_CHUNK_EMBED: &str = "chunks-embed";

/// Errors raised while running or scheduling pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Metadata store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Blob store failure.
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Conversion failure.
    #[error(transparent)]
    Convert(#[from] ConvertError),
    /// Chunker failure.
    #[error(transparent)]
    Chunker(#[from] ChunkerError),
    /// Embedding failure.
    #[error(transparent)]
    Embed(#[from] EmbedError),
    /// Task metadata did not deserialize into a document record.
    #[error("failed to bind task metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    /// The document record lacks a header the stage needs.
    #[error("document missing {0} header")]
    MissingHeader(&'static str),
    /// A task arrived for a function nothing registered.
    #[error("no handler registered for function '{0}'")]
    UnknownFunction(String),
}

/// Shared component handles the stages operate on.
pub(crate) struct PipelineCore {
    pub(crate) store: MetaStore,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) embedder: Arc<Embedder>,
    pub(crate) queue: TaskQueue,
}

impl PipelineCore {
    /// Schedule a stage for a document, replacing any pending task with the
    /// same function so the most recent request wins.
    pub(crate) async fn schedule(
        &self,
        document: &Document,
        function_name: &str,
    ) -> Result<(), PipelineError> {
        let reference_id = document.reference_id().to_string();

        let inserted = self
            .queue
            .insert(function_name, &reference_id, document, Utc::now())
            .await;
        let task = match inserted {
            Ok(task) => task,
            Err(QueueError::Duplicate { .. }) => {
                self.delete_task_if_exists(&reference_id, function_name).await?;
                self.queue
                    .insert(function_name, &reference_id, document, Utc::now())
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            document_id = %document.document_id,
            task = %task.task_id,
            function = function_name,
            "Scheduled stage for document"
        );
        Ok(())
    }

    async fn delete_task_if_exists(
        &self,
        reference_id: &str,
        function_name: &str,
    ) -> Result<(), PipelineError> {
        let tasks = self.queue.find_by_reference_id(reference_id).await?;
        for task in tasks {
            if task.function_name == function_name && task.completed_at.is_none() {
                self.queue.delete(task.task_id).await?;
                tracing::info!(
                    doc = reference_id,
                    task = %task.task_id,
                    function = function_name,
                    "Removed old pending document task"
                );
                return Ok(());
            }
        }
        Ok(())
    }

    /// Bind a task's metadata back into the document record it carries.
    pub(crate) fn bind_document(task: &Task) -> Result<Document, PipelineError> {
        Ok(serde_json::from_value(task.metadata.clone())?)
    }
}

/// One registered pipeline stage.
#[async_trait]
pub(crate) trait StageHandler: Send + Sync {
    /// The queue function name this handler serves.
    fn name(&self) -> &'static str;
    /// Execute the stage for one claimed task.
    async fn run(&self, task: &Task) -> Result<(), PipelineError>;
}

/// The ingestion pipeline: stage registry plus worker pool entry points.
pub struct Pipeline {
    core: Arc<PipelineCore>,
    handlers: HashMap<&'static str, Box<dyn StageHandler>>,
}

impl Pipeline {
    /// Wire the pipeline over its backing components and register the three
    /// stages.
    pub fn new(
        store: MetaStore,
        blobs: Arc<BlobStore>,
        embedder: Arc<Embedder>,
        queue: TaskQueue,
    ) -> Self {
        let core = Arc::new(PipelineCore {
            store,
            blobs,
            embedder,
            queue,
        });

        let mut handlers: HashMap<&'static str, Box<dyn StageHandler>> = HashMap::new();
        for handler in [
            Box::new(convert::ConvertStage::new(core.clone())) as Box<dyn StageHandler>,
            Box::new(chunk::ChunkStage::new(core.clone())),
            Box::new(embed::EmbedStage::new(core.clone())),
        ] {
            handlers.insert(handler.name(), handler);
        }
        tracing::info!(
            funcs = ?handlers.keys().collect::<Vec<_>>(),
            "Initialized pipeline stages"
        );

        Self { core, handlers }
    }

    /// Schedule the conversion stage (stage 1) for a document.
    pub async fn schedule_conversion(&self, document: &Document) -> Result<(), PipelineError> {
        self.core.schedule(document, TASK_DOCUMENT_CONVERSION).await
    }

    /// Schedule the chunking stage (stage 2) for a document.
    pub async fn schedule_chunking(&self, document: &Document) -> Result<(), PipelineError> {
        self.core.schedule(document, TASK_CHUNK_DOCUMENT).await
    }

    /// Schedule the embedding stage (stage 3) for a document.
    pub async fn schedule_embedding(&self, document: &Document) -> Result<(), PipelineError> {
        self.core.schedule(document, TASK_CHUNK_EMBED).await
    }

    /// Report a document's pipeline status from its queue tasks.
    pub async fn document_status(&self, document_id: &str) -> Result<DocumentStatus, PipelineError> {
        let reference_id = document_id.strip_prefix("doc_").unwrap_or(document_id);
        let tasks = self.core.queue.find_by_reference_id(reference_id).await?;

        let status = if tasks
            .iter()
            .any(|t| t.function_name == TASK_CHUNK_EMBED && t.completed())
        {
            Status::Completed
        } else if tasks
            .iter()
            .any(|t| t.exhausted(self.core.queue.max_claim_count()))
        {
            Status::Failed
        } else if !tasks.is_empty() {
            Status::Processing
        } else {
            Status::Pending
        };
        Ok(DocumentStatus { status })
    }

    /// Spawn `count` queue workers that run until shutdown is signalled.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let pipeline = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Pipeline worker started");
                    pipeline.worker_loop(worker, &mut shutdown).await;
                    tracing::debug!(worker, "Pipeline worker stopped");
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let claimed = match self.core.queue.claim_next().await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(worker, error = %err, "Failed to claim task");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            tokio::select! {
                result = self.run_task(&task) => {
                    self.settle(&task, result).await;
                }
                _ = shutdown.changed() => {
                    // Surrender the claim so another worker can pick the
                    // task up after restart.
                    if let Err(err) = self.core.queue.release(task.task_id).await {
                        tracing::error!(task = %task.task_id, error = %err, "Failed to release task on shutdown");
                    }
                    return;
                }
            }
        }
    }

    async fn run_task(&self, task: &Task) -> Result<(), PipelineError> {
        let handler = self
            .handlers
            .get(task.function_name.as_str())
            .ok_or_else(|| PipelineError::UnknownFunction(task.function_name.clone()))?;
        handler.run(task).await
    }

    async fn settle(&self, task: &Task, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => {
                if let Err(err) = self.core.queue.complete(task.task_id).await {
                    tracing::error!(task = %task.task_id, error = %err, "Failed to mark task completed");
                }
            }
            Err(err) => {
                tracing::error!(
                    task = %task.task_id,
                    func = %task.function_name,
                    error = %err,
                    "Task failed, releasing claim"
                );
                if let Err(release_err) = self.core.queue.release(task.task_id).await {
                    tracing::error!(task = %task.task_id, error = %release_err, "Failed to release task");
                }
            }
        }
    }
}
