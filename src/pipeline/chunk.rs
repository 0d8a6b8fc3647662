//! Stage 2: split the Markdown rendition into chunks.

use super::{PipelineCore, PipelineError, StageHandler, TASK_CHUNK_DOCUMENT};
use crate::chunker::SplitterConfig;
use crate::queue::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct ChunkStage {
    core: Arc<PipelineCore>,
}

impl ChunkStage {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl StageHandler for ChunkStage {
    fn name(&self) -> &'static str {
        TASK_CHUNK_DOCUMENT
    }

    async fn run(&self, task: &Task) -> Result<(), PipelineError> {
        let start = Instant::now();
        tracing::info!(task = %task.task_id, func = self.name(), "Starting chunking of document");

        let document = PipelineCore::bind_document(task)?;
        let tub = self.core.store.internal_get_tub(&document.tub_id).await?;

        let markdown = self
            .core
            .blobs
            .get_markdown(&document.tub_name, &document.document_id)
            .await?;
        let markdown = String::from_utf8_lossy(&markdown);

        let splitter = SplitterConfig::from_settings(&tub.settings);
        let chunks = splitter.split(&markdown)?;

        let current = self.core.store.internal_get_chunks(&document).await?;
        let identical = current.len() == chunks.len()
            && current.iter().zip(&chunks).all(|(have, want)| have.content == *want);
        if identical {
            tracing::info!(
                task = %task.task_id,
                document_id = %document.document_id,
                "Chunks are identical to existing ones, skipping update"
            );
            return Ok(());
        }

        self.core.store.internal_replace_chunks(&document, &chunks).await?;

        if chunks.is_empty() {
            tracing::warn!(
                task = %task.task_id,
                document_id = %document.document_id,
                "No chunks created from document"
            );
            return Ok(());
        }

        self.core.schedule(&document, super::TASK_CHUNK_EMBED).await?;

        tracing::info!(
            task = %task.task_id,
            document_id = %document.document_id,
            chunks = chunks.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Task completed"
        );
        Ok(())
    }
}
