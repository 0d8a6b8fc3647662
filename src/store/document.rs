//! Document rows: upsert, header-filtered listing, lookup, and cascading
//! deletion within a tub's schema.

use super::acl::allowed_tub_operation;
use super::{MetaStore, StoreError, normalize_tub_name, push_header_predicates, tub_schema};
use crate::auth::AclOperation;
use crate::filter::DocumentFilter;
use crate::model::{DOCUMENT_ID_PREFIX, Document, Headers, Tub};
use sqlx::QueryBuilder;
use sqlx::types::Json;
use uuid::Uuid;

/// Default page size for document listings.
const DEFAULT_LIST_LIMIT: i64 = 100;

impl MetaStore {
    /// Insert or update a document row.
    ///
    /// A present `document_id` must parse as `doc_<uuid>` and selects an
    /// update; otherwise a new row is inserted with a generated id. Every
    /// header the tub requires must be present with a non-null value.
    /// `updated_at` is left untouched here; the ingestion API bumps it via
    /// [`MetaStore::set_document_updated_now`] only when content changed.
    pub async fn upsert_document(
        &self,
        access_key: &str,
        tub: &Tub,
        document_id: Option<&str>,
        headers: Headers,
    ) -> Result<Document, StoreError> {
        let tub_name = normalize_tub_name(&tub.tub_name)?;
        let schema = tub_schema(&tub_name)?;

        for required in tub.required_document_headers() {
            let present = headers.get(&required).is_some_and(|v| v.is_some());
            if !present {
                return Err(StoreError::MissingRequiredHeader(required));
            }
        }

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(
            &mut *tx,
            access_key,
            &tub_name,
            &[AclOperation::Create, AclOperation::Update],
        )
        .await?;

        let document = match document_id {
            Some(id) => {
                let uuid_part = id
                    .strip_prefix(DOCUMENT_ID_PREFIX)
                    .ok_or_else(|| StoreError::InvalidDocumentId(id.to_string()))?;
                Uuid::parse_str(uuid_part)
                    .map_err(|_| StoreError::InvalidDocumentId(id.to_string()))?;

                sqlx::query_as::<_, Document>(&format!(
                    r#"UPDATE "{schema}"."document"
                       SET headers = $3
                       WHERE tub_id = $1 AND tub_name = $2 AND document_id = $4
                       RETURNING *"#
                ))
                .bind(&tub.tub_id)
                .bind(&tub_name)
                .bind(Json(headers))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::NotFound("document"))?
            }
            None => {
                sqlx::query_as::<_, Document>(&format!(
                    r#"INSERT INTO "{schema}"."document" (tub_id, tub_name, headers)
                       VALUES ($1, $2, $3)
                       RETURNING *"#
                ))
                .bind(&tub.tub_id)
                .bind(&tub_name)
                .bind(Json(headers))
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(document)
    }

    /// List documents matching a header filter. Ordering is unspecified.
    pub async fn list_documents(
        &self,
        access_key: &str,
        tub_name: &str,
        filter: &DocumentFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Document>, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let mut builder = QueryBuilder::new(format!(
            r#"SELECT * FROM "{schema}"."document" document WHERE document.tub_name = "#
        ));
        builder.push_bind(&tub_name);
        push_header_predicates(&mut builder, "document", filter);
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset.max(0));

        let documents = builder
            .build_query_as::<Document>()
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(documents)
    }

    /// Whether every document in the tub carries all the given header keys
    /// with a value.
    pub async fn all_documents_have_headers(
        &self,
        access_key: &str,
        tub_name: &str,
        headers: &[String],
    ) -> Result<bool, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let missing_exists: bool = sqlx::query_scalar(&format!(
            r#"SELECT COUNT(1) > 0
               FROM "{schema}"."document"
               WHERE tub_name = $1
                 AND NOT headers ?& $2"#
        ))
        .bind(&tub_name)
        .bind(headers)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(!missing_exists)
    }

    /// Fetch a document the token may read.
    pub async fn get_document(
        &self,
        access_key: &str,
        tub_name: &str,
        document_id: &str,
    ) -> Result<Document, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Read]).await?;

        let document = sqlx::query_as::<_, Document>(&format!(
            r#"SELECT * FROM "{schema}"."document"
               WHERE tub_name = $1 AND document_id = $2"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("document"))?;

        tx.commit().await?;
        Ok(document)
    }

    /// Delete a document and, through the schema's cascade, its chunks.
    pub async fn delete_document(
        &self,
        access_key: &str,
        tub_name: &str,
        document_id: &str,
    ) -> Result<(), StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Delete]).await?;

        sqlx::query(&format!(
            r#"DELETE FROM "{schema}"."chunk" WHERE tub_name = $1 AND document_id = $2"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(&format!(
            r#"DELETE FROM "{schema}"."document" WHERE tub_name = $1 AND document_id = $2"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(StoreError::NotFound("document"));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Bump a document's `updated_at`; called by the ingestion API after it
    /// has established that content actually changed.
    pub async fn set_document_updated_now(
        &self,
        tub_name: &str,
        document_id: &str,
    ) -> Result<Document, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        sqlx::query_as::<_, Document>(&format!(
            r#"UPDATE "{schema}"."document"
               SET updated_at = now()
               WHERE tub_name = $1 AND document_id = $2
               RETURNING *"#
        ))
        .bind(&tub_name)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("document"))
    }
}
