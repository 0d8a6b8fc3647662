//! Chunk rows: listing, lookup, pipeline-internal replacement, and the
//! header-filtered cosine similarity query.

use super::acl::allowed_tub_operation;
use super::schema::embed_model_column;
use super::{MetaStore, StoreError, normalize_tub_name, push_header_predicates, tub_schema};
use crate::auth::AclOperation;
use crate::embedding::EmbedModel;
use crate::filter::DocumentFilter;
use crate::model::{Chunk, Document};
use pgvector::Vector;
use sqlx::QueryBuilder;

const CHUNK_COLUMNS: &str =
    "tub_id, tub_name, document_id, chunk_id, context, content, created_at, updated_at";

impl MetaStore {
    /// List a document's chunks in index order.
    pub async fn get_chunks(
        &self,
        access_key: &str,
        tub_name: &str,
        document_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Chunk>, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let chunks = sqlx::query_as::<_, Chunk>(&format!(
            r#"SELECT {CHUNK_COLUMNS}
               FROM "{schema}"."chunk"
               WHERE tub_name = $1 AND document_id = $2
               ORDER BY chunk_id
               LIMIT $3 OFFSET $4"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(chunks)
    }

    /// Fetch one chunk by its index within a document.
    pub async fn get_chunk(
        &self,
        access_key: &str,
        tub_name: &str,
        document_id: &str,
        index: i32,
    ) -> Result<Chunk, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let chunk = sqlx::query_as::<_, Chunk>(&format!(
            r#"SELECT {CHUNK_COLUMNS}
               FROM "{schema}"."chunk"
               WHERE tub_name = $1 AND document_id = $2 AND chunk_id = $3"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .bind(index)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("chunk"))?;

        tx.commit().await?;
        Ok(chunk)
    }

    /// Fetch all chunks of a document without an ACL check; pipeline use.
    pub async fn internal_get_chunks(&self, document: &Document) -> Result<Vec<Chunk>, StoreError> {
        let schema = tub_schema(&document.tub_name)?;
        let chunks = sqlx::query_as::<_, Chunk>(&format!(
            r#"SELECT {CHUNK_COLUMNS}
               FROM "{schema}"."chunk"
               WHERE document_id = $1 AND tub_id = $2
               ORDER BY chunk_id"#
        ))
        .bind(&document.document_id)
        .bind(&document.tub_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    /// Replace all chunks of a document in one transaction: delete the old
    /// rows, then bulk-insert the new contents with dense indices.
    pub async fn internal_replace_chunks(
        &self,
        document: &Document,
        contents: &[String],
    ) -> Result<(), StoreError> {
        let schema = tub_schema(&document.tub_name)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"DELETE FROM "{schema}"."chunk" WHERE document_id = $1 AND tub_id = $2"#
        ))
        .bind(&document.document_id)
        .bind(&document.tub_id)
        .execute(&mut *tx)
        .await?;

        if !contents.is_empty() {
            let mut builder = QueryBuilder::new(format!(
                r#"INSERT INTO "{schema}"."chunk" (chunk_id, document_id, tub_id, tub_name, content) "#
            ));
            builder.push_values(contents.iter().enumerate(), |mut row, (index, content)| {
                row.push_bind(index as i32)
                    .push_bind(&document.document_id)
                    .push_bind(&document.tub_id)
                    .push_bind(&document.tub_name)
                    .push_bind(content);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete all chunks of a document without touching the document row.
    pub async fn internal_delete_chunks(&self, document: &Document) -> Result<(), StoreError> {
        let schema = tub_schema(&document.tub_name)?;
        sqlx::query(&format!(
            r#"DELETE FROM "{schema}"."chunk" WHERE document_id = $1 AND tub_id = $2"#
        ))
        .bind(&document.document_id)
        .bind(&document.tub_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rank chunks by cosine distance to a query vector, restricted by a
    /// document-header filter.
    ///
    /// The tub must already have a vector column for the model (it appears
    /// when the first document is embedded with it); chunks without a vector
    /// in that column are excluded. Ties on distance break on
    /// `(document_id, chunk_id)` so pagination is stable.
    pub async fn query_chunk_embeds(
        &self,
        access_key: &str,
        tub_name: &str,
        model: &EmbedModel,
        filter: &DocumentFilter,
        query_vector: Vec<f32>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Chunk>, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;
        let column = embed_model_column(model)?;

        if query_vector.len() != model.output_dimensions {
            return Err(StoreError::VectorDimensionMismatch {
                expected: model.output_dimensions,
                actual: query_vector.len(),
            });
        }

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let column_exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (
                 SELECT 1 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = 'chunk' AND column_name = $2
               )"#,
        )
        .bind(&schema)
        .bind(&column)
        .fetch_one(&mut *tx)
        .await?;
        if !column_exists {
            return Err(StoreError::MissingEmbeddingColumn(model.fqn()));
        }

        let mut builder = QueryBuilder::new(format!(
            r#"SELECT chunk.tub_id, chunk.tub_name, chunk.document_id, chunk.chunk_id,
                      chunk.context, chunk.content, chunk.created_at, chunk.updated_at
               FROM "{schema}"."chunk" chunk
               INNER JOIN "{schema}"."document" document USING (tub_id, document_id)
               WHERE chunk."{column}" IS NOT NULL"#
        ));
        push_header_predicates(&mut builder, "document", filter);
        builder.push(format!(r#" ORDER BY chunk."{column}" <=> "#));
        builder.push_bind(Vector::from(query_vector));
        builder.push(", chunk.document_id, chunk.chunk_id LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let chunks = builder.build_query_as::<Chunk>().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(chunks)
    }
}
