//! Tub lifecycle: creation (with its dedicated schema), settings updates,
//! listing, and cascading deletion.

use super::acl::allowed_tub_operation;
use super::{MetaStore, StoreError, normalize_tub_name, tub_schema};
use crate::auth::AclOperation;
use crate::model::{Headers, Tub};
use sqlx::types::Json;

impl MetaStore {
    /// Create a tub: the row, a full-permission ACL entry for the creating
    /// token, and the per-tub schema with its `document` and `chunk` tables.
    /// Everything happens in one transaction.
    pub async fn create_tub(&self, access_key: &str, tub_name: &str) -> Result<Tub, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;
        let token = self.access_token_by_key(access_key).await?;

        let mut tx = self.pool.begin().await?;

        let tub = sqlx::query_as::<_, Tub>(
            r#"INSERT INTO "public"."tub" (tub_name) VALUES ($1) RETURNING *"#,
        )
        .bind(&tub_name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO "public"."tub_acl"
               (access_key_id, tub_id, tub_name,
                allow_create, allow_read, allow_update, allow_delete)
               VALUES ($1, $2, $3, true, true, true, true)"#,
        )
        .bind(&token.access_key_id)
        .bind(&tub.tub_id)
        .bind(&tub.tub_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(r#"CREATE SCHEMA "{schema}""#))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE "{schema}"."document" (
                 document_id TEXT NOT NULL DEFAULT 'doc_' || gen_random_uuid(),
                 tub_id      TEXT NOT NULL REFERENCES "public"."tub" (tub_id),
                 tub_name    TEXT NOT NULL REFERENCES "public"."tub" (tub_name),

                 headers     JSONB NOT NULL DEFAULT '{{}}',

                 created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                 updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                 PRIMARY KEY (document_id)
               )"#
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE "{schema}"."chunk" (
                 chunk_id    INT,
                 document_id TEXT NOT NULL REFERENCES "{schema}"."document" (document_id) ON DELETE CASCADE,
                 tub_id      TEXT NOT NULL REFERENCES "public"."tub" (tub_id),
                 tub_name    TEXT NOT NULL REFERENCES "public"."tub" (tub_name),

                 context     TEXT NOT NULL DEFAULT '',
                 content     TEXT NOT NULL,

                 created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                 updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                 PRIMARY KEY (document_id, chunk_id)
               )"#
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(tub = %tub.tub_name, "Created tub");
        Ok(tub)
    }

    /// Replace a tub's settings map.
    ///
    /// When the new settings require document headers, every existing
    /// document must already carry them, otherwise the update is refused.
    pub async fn update_tub(
        &self,
        access_key: &str,
        tub_name: &str,
        settings: Headers,
    ) -> Result<Tub, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;

        let required: Vec<String> = settings
            .get("required_document_headers")
            .and_then(|v| v.as_deref())
            .map(|list| {
                list.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if !required.is_empty() {
            let ok = self
                .all_documents_have_headers(access_key, &tub_name, &required)
                .await?;
            if !ok {
                return Err(StoreError::DocumentsMissingHeaders(required.join(", ")));
            }
        }

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Update]).await?;

        let tub = sqlx::query_as::<_, Tub>(
            r#"UPDATE "public"."tub"
               SET settings = $1, updated_at = now()
               WHERE tub_name = $2
               RETURNING *"#,
        )
        .bind(Json(settings))
        .bind(&tub_name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("tub"))?;

        tx.commit().await?;
        Ok(tub)
    }

    /// List tubs the token may read.
    pub async fn list_tubs(&self, access_key: &str) -> Result<Vec<Tub>, StoreError> {
        let tubs = sqlx::query_as::<_, Tub>(
            r#"SELECT t.tub_id, t.tub_name, t.settings, t.created_at, t.updated_at, t.deleted_at
               FROM public.access_token token
               INNER JOIN public.tub_acl acl USING(access_key_id)
               INNER JOIN public.tub t USING(tub_id)
               WHERE token.access_key = $1
                 AND acl.allow_read"#,
        )
        .bind(access_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(tubs)
    }

    /// Fetch a tub the token may read.
    pub async fn get_tub(&self, access_key: &str, tub_name: &str) -> Result<Tub, StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        sqlx::query_as::<_, Tub>(
            r#"SELECT t.tub_id, t.tub_name, t.settings, t.created_at, t.updated_at, t.deleted_at
               FROM public.access_token token
               INNER JOIN public.tub_acl acl USING(access_key_id)
               INNER JOIN public.tub t USING(tub_name)
               WHERE token.access_key = $1
                 AND t.tub_name = $2
                 AND acl.allow_read"#,
        )
        .bind(access_key)
        .bind(&tub_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("tub"))
    }

    /// Fetch a tub by id without an ACL check; pipeline-internal.
    pub async fn internal_get_tub(&self, tub_id: &str) -> Result<Tub, StoreError> {
        sqlx::query_as::<_, Tub>(r#"SELECT * FROM "public"."tub" WHERE tub_id = $1"#)
            .bind(tub_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("tub"))
    }

    /// Delete a tub: drop its schema (cascading to documents and chunks),
    /// then remove ACL rows and the tub row itself.
    pub async fn delete_tub(&self, access_key: &str, tub_name: &str) -> Result<(), StoreError> {
        let tub_name = normalize_tub_name(tub_name)?;
        let schema = tub_schema(&tub_name)?;

        let mut tx = self.pool.begin().await?;
        allowed_tub_operation(&mut *tx, access_key, &tub_name, &[AclOperation::Delete]).await?;

        sqlx::query(&format!(r#"DROP SCHEMA IF EXISTS "{schema}" CASCADE"#))
            .execute(&mut *tx)
            .await?;
        sqlx::query(r#"DELETE FROM "public"."tub_acl" WHERE tub_name = $1"#)
            .bind(&tub_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r#"DELETE FROM "public"."tub" WHERE tub_name = $1"#)
            .bind(&tub_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(tub = %tub_name, "Deleted tub");
        Ok(())
    }
}
