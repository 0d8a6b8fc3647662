//! Stage 3: embed a document's chunks into the model's vector column.

use super::{PipelineCore, PipelineError, StageHandler, TASK_CHUNK_EMBED};
use crate::queue::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct EmbedStage {
    core: Arc<PipelineCore>,
}

impl EmbedStage {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl StageHandler for EmbedStage {
    fn name(&self) -> &'static str {
        TASK_CHUNK_EMBED
    }

    async fn run(&self, task: &Task) -> Result<(), PipelineError> {
        let start = Instant::now();
        tracing::info!(task = %task.task_id, func = self.name(), "Starting embedding of document");

        let document = PipelineCore::bind_document(task)?;
        let tub = self.core.store.internal_get_tub(&document.tub_id).await?;

        let chunks = self.core.store.internal_get_chunks(&document).await?;
        if chunks.is_empty() {
            tracing::warn!(
                task = %task.task_id,
                document_id = %document.document_id,
                "No chunks to embed, skipping"
            );
            return Ok(());
        }

        let model = self.core.embedder.model_or_default(tub.setting("embed_model"));

        self.core.store.ensure_embedding_schema(&document, &model).await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.core.embedder.embed_document(&model, &texts).await?;

        self.core
            .store
            .internal_set_embeddings(&document, &model, &chunks, vectors)
            .await?;

        tracing::info!(
            task = %task.task_id,
            document_id = %document.document_id,
            model = %model.fqn(),
            chunks = chunks.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Task completed"
        );
        Ok(())
    }
}
