//! Core records shared between the metadata store, the pipeline, and the
//! HTTP surface: tubs, documents, chunks, and access tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashMap;

/// Prefix carried by every document identifier.
pub const DOCUMENT_ID_PREFIX: &str = "doc_";

/// Header map attached to documents and tub settings: lowercase keys with
/// nullable string values, stored as JSONB.
pub type Headers = HashMap<String, Option<String>>;

/// A tub is a tenant-scoped logical collection of documents with its own
/// relational namespace and blob prefix.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tub {
    /// Stable identifier (`tub_<uuid>`).
    pub tub_id: String,
    /// Unique lowercase name (`[a-z0-9_-]{3,}`).
    pub tub_name: String,
    /// Settings map: chunking policy, embedding model, required headers.
    pub settings: Json<Headers>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last settings update.
    pub updated_at: DateTime<Utc>,
    /// Tombstone timestamp, unset while the tub is live.
    #[serde(skip_serializing, default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tub {
    /// Read a single setting, treating stored nulls as absent.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_deref())
    }

    /// Header names every document in this tub must carry.
    pub fn required_document_headers(&self) -> Vec<String> {
        match self.setting("required_document_headers") {
            None => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }
}

/// One addressable piece of content within a tub.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    /// Identifier of the form `doc_<uuid>`.
    pub document_id: String,
    /// Owning tub id.
    pub tub_id: String,
    /// Owning tub name.
    pub tub_name: String,
    /// Document headers: at least `content-type`, `content-length` and
    /// `content-disposition`, plus any stripped `x-ragnar-*` headers.
    pub headers: Json<Headers>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Bumped only when original bytes, Markdown, or chunks actually change.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// The `<uuid>` portion of the document id, used as the queue reference.
    pub fn reference_id(&self) -> &str {
        self.document_id
            .strip_prefix(DOCUMENT_ID_PREFIX)
            .unwrap_or(&self.document_id)
    }
}

/// One ordered fragment of a document's Markdown rendition; the unit of
/// embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Chunk {
    /// Owning tub id.
    pub tub_id: String,
    /// Owning tub name.
    pub tub_name: String,
    /// Owning document id.
    pub document_id: String,
    /// Zero-based index within the document.
    pub chunk_id: i32,
    /// Optional surrounding context, empty unless populated by a client.
    #[serde(default)]
    pub context: String,
    /// Chunk text.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last rewrite timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Chunk payload accepted in the multipart `chunks` part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedChunk {
    /// Zero-based index; uploads must form a dense `0..N-1` sequence.
    pub chunk_id: i32,
    /// Chunk text.
    pub content: String,
}

/// Authentication record backing both raw bearer keys and signed JWTs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessToken {
    /// Key id, referenced by the `kid` header of signed JWTs.
    pub access_key_id: String,
    /// Bearer secret of the form `rag_<uuid>`.
    pub access_key: String,
    /// Human-readable label.
    pub token_name: String,
    /// Whether the token may create new tubs.
    pub allow_create_tubs: bool,
    /// Whether the token may list tubs.
    pub allow_read_tubs: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Revocation tombstone.
    #[serde(skip_serializing, default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Pipeline progress of a document as observed through the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatus {
    /// Current lifecycle phase.
    pub status: Status,
}

/// Lifecycle phases reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No pipeline task exists for the document yet.
    Pending,
    /// At least one task is queued or running.
    Processing,
    /// The embed stage has completed.
    Completed,
    /// A task exhausted its retry budget.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn tub_with_settings(settings: Headers) -> Tub {
        Tub {
            tub_id: "tub_1".into(),
            tub_name: "docs".into(),
            settings: Json(settings),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn required_headers_split_and_trim() {
        let mut settings = Headers::new();
        settings.insert(
            "required_document_headers".into(),
            Some("source, mfn-news-id".into()),
        );
        let tub = tub_with_settings(settings);
        assert_eq!(tub.required_document_headers(), vec!["source", "mfn-news-id"]);
    }

    #[test]
    fn required_headers_absent_or_null() {
        assert!(tub_with_settings(Headers::new()).required_document_headers().is_empty());

        let mut settings = Headers::new();
        settings.insert("required_document_headers".into(), None);
        assert!(tub_with_settings(settings).required_document_headers().is_empty());
    }

    #[test]
    fn reference_id_strips_prefix() {
        let doc = Document {
            document_id: "doc_0a361bcc-0a55-4f38-8f3e-f16f0f1a0b6e".into(),
            tub_id: "tub_1".into(),
            tub_name: "docs".into(),
            headers: Json(Headers::new()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(doc.reference_id(), "0a361bcc-0a55-4f38-8f3e-f16f0f1a0b6e");
    }

    #[test]
    fn status_serializes_lowercase() {
        let status = DocumentStatus { status: Status::Processing };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"status":"processing"}"#
        );
    }
}
