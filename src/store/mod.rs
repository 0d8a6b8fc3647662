//! Metadata store: tubs, documents, chunks, ACLs, and the per-tub vector
//! schema, all backed by Postgres with the pgvector extension.
//!
//! Tenant isolation is relational: every tub owns a dedicated schema named
//! `_tub[<tub_name>]` holding its `document` and `chunk` tables, while the
//! shared `public` schema holds `tub`, `tub_acl`, `access_token`, and the
//! pipeline queue. Header maps are JSONB, so header predicates compile to
//! single `headers ->> 'key'` lookups.

mod acl;
mod chunk;
mod document;
mod schema;
mod tub;

use crate::filter::{Clause, DocumentFilter};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by metadata store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Tub names must match `[a-z0-9_-]{3,}`.
    #[error("tub name must only contain a-z0-9_-, and be at least 3 characters long")]
    InvalidTubName,
    /// A referenced tub, document, or chunk does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The access token lacks one of the requested permissions.
    #[error("access token does not have the requested permissions")]
    PermissionDenied,
    /// A document id failed to parse as `doc_<uuid>`.
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
    /// A document is missing a header its tub requires.
    #[error("missing required document header: {0}")]
    MissingRequiredHeader(String),
    /// Tub settings cannot require headers that existing documents lack.
    #[error("cannot update tub, some documents are missing required headers: {0}")]
    DocumentsMissingHeaders(String),
    /// The model name cannot be turned into a column identifier.
    #[error("invalid model name, could not convert to column name")]
    InvalidModelName,
    /// The model declares a non-positive output dimension.
    #[error("model {model} has invalid output dimensions: {dimensions}")]
    InvalidModelDimensions {
        /// Offending model FQN.
        model: String,
        /// Declared dimension count.
        dimensions: usize,
    },
    /// The tub has never been embedded with the requested model.
    #[error("tub has no embeddings for model {0}")]
    MissingEmbeddingColumn(String),
    /// The query vector does not match the model's output dimensions.
    #[error("query vector has {actual} dimensions, model expects {expected}")]
    VectorDimensionMismatch {
        /// Dimensions required by the model.
        expected: usize,
        /// Dimensions supplied by the caller.
        actual: usize,
    },
    /// Chunk and vector counts diverged during an embedding write.
    #[error("number of chunks ({chunks}) does not match number of vectors ({vectors})")]
    EmbeddingCountMismatch {
        /// Chunks selected for the update.
        chunks: usize,
        /// Vectors supplied.
        vectors: usize,
    },
    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Applying embedded migrations failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the metadata database.
#[derive(Clone)]
pub struct MetaStore {
    pool: PgPool,
}

/// Validate a tub name and derive its dedicated schema name.
pub(crate) fn tub_schema(tub_name: &str) -> Result<String, StoreError> {
    let name = tub_name.to_lowercase();
    let valid = name.len() >= 3
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(StoreError::InvalidTubName);
    }
    Ok(format!("_tub[{name}]"))
}

/// Normalize and validate a tub name.
pub(crate) fn normalize_tub_name(tub_name: &str) -> Result<String, StoreError> {
    let name = tub_name.to_lowercase();
    tub_schema(&name)?;
    Ok(name)
}

impl MetaStore {
    /// Connect to the database, retrying until it accepts connections, then
    /// bootstrap extensions (dev mode only) and apply migrations.
    pub async fn connect(uri: &str, dev: bool) -> Result<Self, StoreError> {
        let pool = loop {
            tracing::info!("Trying to connect to db..");
            match PgPoolOptions::new()
                .max_connections(16)
                .acquire_timeout(Duration::from_secs(10))
                .connect(uri)
                .await
            {
                Ok(pool) => break pool,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to connect to database, retrying in 3 seconds");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        };
        tracing::info!("Successfully connected to the PostgreSQL database");

        if dev {
            tracing::info!("Applying extensions..");
            sqlx::raw_sql(
                "CREATE EXTENSION IF NOT EXISTS vector CASCADE;
                 CREATE EXTENSION IF NOT EXISTS pgcrypto CASCADE;",
            )
            .execute(&pool)
            .await?;
        }

        tracing::info!("Applying migrations..");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool; used by components sharing the connection.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe for `/ping/db`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool, bounded by the caller's timeout context.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Append `AND ..` predicates for every filter clause against the given
/// table alias. Field names and values are always bound, never spliced.
pub(crate) fn push_header_predicates(
    builder: &mut QueryBuilder<'_, Postgres>,
    alias: &str,
    filter: &DocumentFilter,
) {
    for (field, clauses) in &filter.0 {
        for clause in clauses {
            match clause {
                Clause::Equals(value) => {
                    builder.push(format!(" AND {alias}.headers ->> "));
                    builder.push_bind(field.clone());
                    builder.push(" = ");
                    builder.push_bind(value.clone());
                }
                Clause::AnyOf(values) => {
                    builder.push(format!(" AND {alias}.headers ->> "));
                    builder.push_bind(field.clone());
                    builder.push(" = ANY(");
                    builder.push_bind(values.clone());
                    builder.push(")");
                }
                Clause::Compare { op, value, cast } => {
                    let cast_type = match cast {
                        crate::filter::Cast::Text => None,
                        crate::filter::Cast::Integer => Some("INTEGER"),
                        crate::filter::Cast::Numeric => Some("NUMERIC"),
                    };
                    match cast_type {
                        None => {
                            builder.push(format!(" AND {alias}.headers ->> "));
                            builder.push_bind(field.clone());
                            builder.push(format!(" {} ", op.sql()));
                            builder.push_bind(value.clone());
                        }
                        Some(cast_type) => {
                            builder.push(format!(" AND CAST({alias}.headers ->> "));
                            builder.push_bind(field.clone());
                            builder.push(format!(" AS {cast_type}) {} CAST(", op.sql()));
                            builder.push_bind(value.clone());
                            builder.push(format!(" AS {cast_type})"));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Cast, DocumentFilter, Operator};

    #[test]
    fn schema_name_is_deterministic() {
        assert_eq!(tub_schema("mfn-test").unwrap(), "_tub[mfn-test]");
        assert_eq!(tub_schema("MFN-Test").unwrap(), "_tub[mfn-test]");
    }

    #[test]
    fn schema_name_rejects_bad_tub_names() {
        assert!(tub_schema("ab").is_err());
        assert!(tub_schema("has space").is_err());
        assert!(tub_schema("semi;colon").is_err());
        assert!(tub_schema("dotted.name").is_err());
        assert!(tub_schema("").is_err());
    }

    #[test]
    fn predicates_bind_fields_and_values() {
        let filter = DocumentFilter::default()
            .with_equal("status", "active")
            .with_any_of("env", &["prod", "staging"])
            .with_compare("priority", Operator::Gte, "10", Cast::Integer);

        let mut builder = QueryBuilder::new("SELECT 1 WHERE TRUE");
        push_header_predicates(&mut builder, "document", &filter);
        let sql = builder.sql();

        // BTreeMap ordering: env, priority, status.
        assert!(sql.contains("document.headers ->> $1 = ANY($2)"));
        assert!(sql.contains("CAST(document.headers ->> $3 AS INTEGER) >= CAST($4 AS INTEGER)"));
        assert!(sql.contains("document.headers ->> $5 = $6"));
        // No user-supplied text may be spliced into the SQL itself.
        assert!(!sql.contains("active"));
        assert!(!sql.contains("prod"));
        assert!(!sql.contains("10"));
    }
}
