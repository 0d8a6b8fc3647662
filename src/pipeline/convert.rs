//! Stage 1: convert the original document to Markdown.

use super::{PipelineCore, PipelineError, StageHandler, TASK_DOCUMENT_CONVERSION};
use crate::convert;
use crate::queue::Task;
use crate::util::sha256_hex;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct ConvertStage {
    core: Arc<PipelineCore>,
}

impl ConvertStage {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl StageHandler for ConvertStage {
    fn name(&self) -> &'static str {
        TASK_DOCUMENT_CONVERSION
    }

    async fn run(&self, task: &Task) -> Result<(), PipelineError> {
        let start = Instant::now();
        tracing::info!(task = %task.task_id, func = self.name(), "Starting conversion of document");

        let document = PipelineCore::bind_document(task)?;

        let original = self
            .core
            .blobs
            .get_document(&document.tub_name, &document.document_id)
            .await?;

        let content_type = document
            .headers
            .get("content-type")
            .and_then(|v| v.as_deref())
            .ok_or(PipelineError::MissingHeader("content-type"))?;
        let content_disposition = document
            .headers
            .get("content-disposition")
            .and_then(|v| v.as_deref())
            .ok_or(PipelineError::MissingHeader("content-disposition"))?;

        let markdown = convert::to_markdown(original, content_type, content_disposition).await?;
        let markdown_hash = sha256_hex(&markdown);

        // The put short-circuits when the Markdown hash is unchanged; the
        // chunk stage is scheduled either way and no-ops on identical
        // chunks, which keeps re-runs idempotent.
        self.core
            .blobs
            .put_markdown(
                &document.tub_name,
                &document.document_id,
                markdown,
                &document.headers,
                &markdown_hash,
            )
            .await?;

        self.core.schedule(&document, super::TASK_CHUNK_DOCUMENT).await?;

        tracing::info!(
            task = %task.task_id,
            document_id = %document.document_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Task completed"
        );
        Ok(())
    }
}
