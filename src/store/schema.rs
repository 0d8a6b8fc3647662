//! Per-model schema evolution on the chunk table.
//!
//! Every embedding model used in a tub gets its own nullable
//! `vector(<dims>)` column named `embedding_<sanitized model name>` plus a
//! cosine-distance HNSW index. Adding the column is idempotent and safe
//! under concurrent callers.

use super::{MetaStore, StoreError, tub_schema};
use crate::embedding::EmbedModel;
use crate::model::{Chunk, Document};
use pgvector::Vector;

/// Derive the chunk-table column name for a model: lowercase, non-alphanumeric
/// characters to underscores, trimmed, digit-prefix escaped, and prefixed
/// with `embedding_`.
pub(crate) fn embed_model_column(model: &EmbedModel) -> Result<String, StoreError> {
    let mut name: String = model
        .name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect();
    name = name.trim_matches('_').to_string();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    if name.is_empty() {
        return Err(StoreError::InvalidModelName);
    }
    Ok(format!("embedding_{name}"))
}

/// Whether a database error is the duplicate-column race from a concurrent
/// `ALTER TABLE .. ADD COLUMN`.
fn is_duplicate_column(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42701"))
}

impl MetaStore {
    /// Ensure the tub's chunk table has a vector column and HNSW index for
    /// the model. Idempotent; a concurrent caller adding the same column
    /// must not fail.
    pub async fn ensure_embedding_schema(
        &self,
        document: &Document,
        model: &EmbedModel,
    ) -> Result<(), StoreError> {
        let schema = tub_schema(&document.tub_name)?;
        let column = embed_model_column(model)?;
        if model.output_dimensions == 0 {
            return Err(StoreError::InvalidModelDimensions {
                model: model.fqn(),
                dimensions: model.output_dimensions,
            });
        }

        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (
                 SELECT 1 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = 'chunk' AND column_name = $2
               )"#,
        )
        .bind(&schema)
        .bind(&column)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            return Ok(());
        }

        let alter = format!(
            r#"ALTER TABLE "{schema}"."chunk" ADD COLUMN "{column}" VECTOR({}) DEFAULT NULL"#,
            model.output_dimensions
        );
        match sqlx::query(&alter).execute(&self.pool).await {
            Ok(_) => {}
            Err(err) if is_duplicate_column(&err) => {
                tracing::debug!(column = %column, "Vector column added concurrently");
            }
            Err(err) => return Err(err.into()),
        }

        let index = format!(
            r#"CREATE INDEX IF NOT EXISTS "chunk_{column}_hnsw_idx"
               ON "{schema}"."chunk" USING hnsw ("{column}" vector_cosine_ops)"#
        );
        sqlx::query(&index).execute(&self.pool).await?;

        tracing::info!(
            tub = %document.tub_name,
            column = %column,
            dimensions = model.output_dimensions,
            "Ensured embedding column and index"
        );
        Ok(())
    }

    /// Write one vector per chunk into the model's column, keyed by
    /// `(document_id, chunk_id)`. Overwrites on re-run, which is what makes
    /// the embed stage idempotent.
    pub async fn internal_set_embeddings(
        &self,
        document: &Document,
        model: &EmbedModel,
        chunks: &[Chunk],
        vectors: Vec<Vec<f32>>,
    ) -> Result<(), StoreError> {
        if chunks.len() != vectors.len() {
            return Err(StoreError::EmbeddingCountMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        let schema = tub_schema(&document.tub_name)?;
        let column = embed_model_column(model)?;

        let query = format!(
            r#"UPDATE "{schema}"."chunk" SET "{column}" = $1
               WHERE document_id = $2 AND tub_id = $3 AND chunk_id = $4"#
        );

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            sqlx::query(&query)
                .bind(Vector::from(vector))
                .bind(&chunk.document_id)
                .bind(&chunk.tub_id)
                .bind(chunk.chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> EmbedModel {
        EmbedModel {
            provider: "voyageai".into(),
            name: name.into(),
            input_max_tokens: 32_000,
            output_dimensions: 1024,
        }
    }

    #[test]
    fn sanitizes_model_names() {
        assert_eq!(
            embed_model_column(&model("voyage-context-3")).unwrap(),
            "embedding_voyage_context_3"
        );
        assert_eq!(
            embed_model_column(&model("Text.Embedding/V2")).unwrap(),
            "embedding_text_embedding_v2"
        );
    }

    #[test]
    fn trims_underscores_and_escapes_digit_prefix() {
        assert_eq!(embed_model_column(&model("--v3--")).unwrap(), "embedding_v3");
        assert_eq!(embed_model_column(&model("3-large")).unwrap(), "embedding__3_large");
    }

    #[test]
    fn rejects_unusable_names() {
        assert!(matches!(
            embed_model_column(&model("___")),
            Err(StoreError::InvalidModelName)
        ));
        assert!(matches!(
            embed_model_column(&model("")),
            Err(StoreError::InvalidModelName)
        ));
    }
}
