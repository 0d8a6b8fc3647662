//! Small shared helpers.

use crate::model::{Chunk, UploadedChunk};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a byte slice; the content hash stored on blobs.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether stored chunks and uploaded chunks agree in ids and content.
pub fn chunks_content_equal(stored: &[Chunk], uploaded: &[UploadedChunk]) -> bool {
    stored.len() == uploaded.len()
        && stored
            .iter()
            .zip(uploaded)
            .all(|(a, b)| a.chunk_id == b.chunk_id && a.content == b.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn hashes_match_known_vector() {
        assert_eq!(
            sha256_hex(b"This is test document content"),
            "b8a84fc01b0be37eb2499e3c60dde1b4e31157c8e5e6485f4ff6e828865134d6"
        );
    }

    #[test]
    fn empty_hash_is_the_sha256_empty_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    fn chunk(id: i32, content: &str) -> Chunk {
        Chunk {
            tub_id: "tub_1".into(),
            tub_name: "docs".into(),
            document_id: "doc_1".into(),
            chunk_id: id,
            context: String::new(),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn uploaded(id: i32, content: &str) -> UploadedChunk {
        UploadedChunk {
            chunk_id: id,
            content: content.into(),
        }
    }

    #[test]
    fn equal_chunks_compare_equal() {
        let stored = vec![chunk(0, "a"), chunk(1, "b")];
        let up = vec![uploaded(0, "a"), uploaded(1, "b")];
        assert!(chunks_content_equal(&stored, &up));
    }

    #[test]
    fn divergent_chunks_compare_unequal() {
        let stored = vec![chunk(0, "a"), chunk(1, "b")];
        assert!(!chunks_content_equal(&stored, &[uploaded(0, "a")]));
        assert!(!chunks_content_equal(
            &stored,
            &[uploaded(0, "a"), uploaded(1, "c")]
        ));
        assert!(!chunks_content_equal(
            &stored,
            &[uploaded(0, "a"), uploaded(2, "b")]
        ));
    }
}
