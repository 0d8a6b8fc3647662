//! Blob storage for original documents and their Markdown renditions.
//!
//! One bucket holds everything; objects live under `<tub>/<document_id>`
//! (original bytes) and `<tub>/<document_id>.md` (derived Markdown). Every
//! object carries a `file-hash` metadata entry with the hex SHA-256 of its
//! body, which lets uploads short-circuit when the content is unchanged.

use crate::model::Headers;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::{Attribute, Attributes, GetOptions, ObjectStore, PutOptions};
use thiserror::Error;

/// Metadata key carrying the hex SHA-256 of the object body.
const FILE_HASH_METADATA_KEY: &str = "file-hash";

/// Errors raised by blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The requested object does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The object store rejected or failed the operation.
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
    /// One or more objects under a prefix could not be deleted.
    #[error("failed to delete {failed} object(s) under prefix {prefix}: {detail}")]
    PrefixDelete {
        /// The prefix being cleared.
        prefix: String,
        /// How many deletions failed.
        failed: usize,
        /// Concatenated per-object failure messages.
        detail: String,
    },
}

/// Configuration for the blob store.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// S3 endpoint, with or without an URL scheme.
    pub endpoint: String,
    /// Bucket holding all tubs.
    pub bucket: String,
    /// Static access key.
    pub access_key: String,
    /// Static secret key.
    pub secret_key: String,
    /// Use TLS and disallow plain HTTP.
    pub production: bool,
}

/// S3-backed store for original and Markdown document blobs.
pub struct BlobStore {
    store: AmazonS3,
    bucket: String,
}

impl BlobStore {
    /// Connect to the configured bucket.
    pub fn new(config: &BlobConfig) -> Result<Self, BlobError> {
        let scheme = if config.production { "https" } else { "http" };
        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("{scheme}://{}", config.endpoint)
        };

        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key)
            .with_region("us-east-1")
            .with_allow_http(!config.production)
            .build()?;

        Ok(Self {
            store,
            bucket: config.bucket.clone(),
        })
    }

    fn original_path(tub: &str, document_id: &str) -> Path {
        Path::from(format!("{tub}/{document_id}"))
    }

    fn markdown_path(tub: &str, document_id: &str) -> Path {
        Path::from(format!("{tub}/{document_id}.md"))
    }

    /// Store the original document bytes.
    ///
    /// Returns `true` when the object changed, `false` when an object with
    /// the same content hash was already present and the upload was skipped.
    /// The request `content-type` and `content-disposition` headers become
    /// first-class object attributes; remaining headers go into metadata.
    pub async fn put_document(
        &self,
        tub: &str,
        document_id: &str,
        data: Bytes,
        headers: &Headers,
        content_hash: &str,
    ) -> Result<bool, BlobError> {
        let path = Self::original_path(tub, document_id);
        tracing::info!(bucket = %self.bucket, path = %path, size = data.len(), "Storing document");

        if self.object_hash(&path).await?.as_deref() == Some(content_hash) {
            tracing::info!(path = %path, "Document already stored with same hash, skipping upload");
            return Ok(false);
        }

        let mut attributes = Attributes::new();
        for (key, value) in headers {
            let Some(value) = value else { continue };
            match key.as_str() {
                "content-type" => {
                    attributes.insert(Attribute::ContentType, value.clone().into());
                }
                "content-disposition" => {
                    attributes.insert(Attribute::ContentDisposition, value.clone().into());
                }
                _ => {
                    attributes.insert(
                        Attribute::Metadata(key.clone().into()),
                        sanitize_metadata_value(value).into(),
                    );
                }
            }
        }
        attributes.insert(
            Attribute::Metadata(FILE_HASH_METADATA_KEY.into()),
            content_hash.to_owned().into(),
        );

        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store.put_opts(&path, data.into(), options).await?;
        tracing::info!(bucket = %self.bucket, path = %path, "Successfully uploaded");
        Ok(true)
    }

    /// Store the Markdown rendition of a document. Same change semantics as
    /// [`BlobStore::put_document`]; the content type is always
    /// `text/markdown` and the document's own content headers are not copied.
    pub async fn put_markdown(
        &self,
        tub: &str,
        document_id: &str,
        data: Bytes,
        headers: &Headers,
        content_hash: &str,
    ) -> Result<bool, BlobError> {
        let path = Self::markdown_path(tub, document_id);
        tracing::info!(bucket = %self.bucket, path = %path, size = data.len(), "Storing document markdown");

        if self.object_hash(&path).await?.as_deref() == Some(content_hash) {
            tracing::info!(path = %path, "Markdown already stored with same hash, skipping upload");
            return Ok(false);
        }

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "text/markdown".into());
        for (key, value) in headers {
            let Some(value) = value else { continue };
            if key == "content-type" || key == "content-disposition" {
                continue;
            }
            attributes.insert(
                Attribute::Metadata(key.clone().into()),
                sanitize_metadata_value(value).into(),
            );
        }
        attributes.insert(
            Attribute::Metadata(FILE_HASH_METADATA_KEY.into()),
            content_hash.to_owned().into(),
        );

        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store.put_opts(&path, data.into(), options).await?;
        tracing::info!(bucket = %self.bucket, path = %path, "Successfully uploaded");
        Ok(true)
    }

    /// Fetch the stored content hash of an object, or `None` when the object
    /// does not exist yet.
    async fn object_hash(&self, path: &Path) -> Result<Option<String>, BlobError> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.store.get_opts(path, options).await {
            Ok(result) => Ok(result
                .attributes
                .get(&Attribute::Metadata(FILE_HASH_METADATA_KEY.into()))
                .map(|v| v.to_string())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch the original bytes of a document.
    pub async fn get_document(&self, tub: &str, document_id: &str) -> Result<Bytes, BlobError> {
        self.fetch(Self::original_path(tub, document_id)).await
    }

    /// Fetch the Markdown rendition of a document.
    pub async fn get_markdown(&self, tub: &str, document_id: &str) -> Result<Bytes, BlobError> {
        self.fetch(Self::markdown_path(tub, document_id)).await
    }

    async fn fetch(&self, path: Path) -> Result<Bytes, BlobError> {
        match self.store.get(&path).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => Err(BlobError::NotFound(path.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete both blobs of a document. Missing objects are not an error.
    pub async fn delete_document(&self, tub: &str, document_id: &str) -> Result<(), BlobError> {
        for path in [
            Self::original_path(tub, document_id),
            Self::markdown_path(tub, document_id),
        ] {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Delete every object under a tub's prefix, collecting per-object
    /// failures into a single aggregate error.
    pub async fn delete_tub_prefix(&self, tub: &str) -> Result<(), BlobError> {
        let prefix = Path::from(tub);
        tracing::debug!(tub, "Starting deletion of all objects under tub prefix");

        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut failures = Vec::new();
        for meta in objects {
            tracing::debug!(tub, object = %meta.location, "Deleting object");
            if let Err(err) = self.store.delete(&meta.location).await {
                failures.push(format!("{}: {err}", meta.location));
            }
        }

        if !failures.is_empty() {
            return Err(BlobError::PrefixDelete {
                prefix: tub.to_string(),
                failed: failures.len(),
                detail: failures.join("; "),
            });
        }
        tracing::debug!(tub, "Deleted all objects under tub prefix");
        Ok(())
    }
}

/// Strip non-printable characters from a header value before it becomes
/// object metadata. Non-breaking spaces become plain spaces; other
/// non-graphic characters are dropped.
fn sanitize_metadata_value(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| match c {
            '\u{00A0}' => Some(' '),
            ' ' => Some(' '),
            c if c.is_control() || c.is_whitespace() => None,
            c => Some(c),
        })
        .collect()
}
