//! Access token lookups and ACL checks.
//!
//! Authorization is evaluated inside the store so a check can share the
//! transaction of the statement it guards. Tokens and ACL rows are revoked
//! with a tombstone timestamp rather than deleted.

use super::{MetaStore, StoreError, normalize_tub_name};
use crate::auth::AclOperation;
use crate::model::AccessToken;
use sqlx::postgres::PgExecutor;

impl MetaStore {
    /// Look up a live access token by its bearer key.
    pub async fn access_token_by_key(&self, access_key: &str) -> Result<AccessToken, StoreError> {
        sqlx::query_as::<_, AccessToken>(
            r#"SELECT * FROM "public"."access_token"
               WHERE access_key = $1 AND now() <= coalesce(deleted_at, now())"#,
        )
        .bind(access_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("access token"))
    }

    /// Look up a live access token by its key id (the JWT `kid`).
    pub async fn access_token_by_key_id(&self, key_id: &str) -> Result<AccessToken, StoreError> {
        sqlx::query_as::<_, AccessToken>(
            r#"SELECT * FROM "public"."access_token"
               WHERE access_key_id = $1 AND now() <= coalesce(deleted_at, now())"#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("access token"))
    }

    /// Check global token capabilities (`allow_create_tubs`,
    /// `allow_read_tubs`).
    pub async fn allowed_operation(
        &self,
        access_key: &str,
        operations: &[AclOperation],
    ) -> Result<(), StoreError> {
        allowed_general_operation(&self.pool, access_key, operations).await
    }

    /// Check per-tub permissions against `tub_acl`.
    pub async fn allowed_tub_operation(
        &self,
        access_key: &str,
        tub_name: &str,
        operations: &[AclOperation],
    ) -> Result<(), StoreError> {
        allowed_tub_operation(&self.pool, access_key, tub_name, operations).await
    }
}

/// Transaction-friendly per-tub ACL check.
pub(crate) async fn allowed_tub_operation<'e, E>(
    executor: E,
    access_key: &str,
    tub_name: &str,
    operations: &[AclOperation],
) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    let tub_name = normalize_tub_name(tub_name)?;
    if operations.is_empty() {
        return Err(StoreError::PermissionDenied);
    }

    let mut query = String::from(
        r#"SELECT count(*) > 0
           FROM "public"."tub_acl" a
           INNER JOIN "public"."access_token" t USING(access_key_id)
           WHERE t.access_key = $1
             AND a.tub_name = $2
             AND now() <= coalesce(t.deleted_at, now())
             AND now() <= coalesce(a.deleted_at, now())"#,
    );
    for operation in operations {
        query.push_str(&format!(" AND a.{}", operation.acl_column()));
    }

    let allowed: bool = sqlx::query_scalar(&query)
        .bind(access_key)
        .bind(&tub_name)
        .fetch_one(executor)
        .await?;

    if !allowed {
        return Err(StoreError::PermissionDenied);
    }
    Ok(())
}

/// Transaction-friendly global capability check. Only `Create` and `Read`
/// exist at the global level.
pub(crate) async fn allowed_general_operation<'e, E>(
    executor: E,
    access_key: &str,
    operations: &[AclOperation],
) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    if operations.is_empty() {
        return Err(StoreError::PermissionDenied);
    }

    let mut query = String::from(
        r#"SELECT count(*) > 0
           FROM "public"."access_token" t
           WHERE t.access_key = $1
             AND now() <= coalesce(t.deleted_at, now())"#,
    );
    for operation in operations {
        match operation {
            AclOperation::Create => query.push_str(" AND t.allow_create_tubs"),
            AclOperation::Read => query.push_str(" AND t.allow_read_tubs"),
            AclOperation::Update | AclOperation::Delete => {
                return Err(StoreError::PermissionDenied);
            }
        }
    }

    let allowed: bool = sqlx::query_scalar(&query)
        .bind(access_key)
        .fetch_one(executor)
        .await?;

    if !allowed {
        return Err(StoreError::PermissionDenied);
    }
    Ok(())
}
