//! Batching for whole-document embedding.
//!
//! The planner packs ordered chunk texts into batches that fit the model's
//! input token budget using a caller-supplied chars-per-token estimate.
//! Batches after the first are prefixed with a few anchor chunks from the
//! start of the document so the model sees document-level context; the
//! caller discards the anchor embeddings via [`PlannedBatch::anchor_count`].

/// Upper bound on anchor chunks prepended to follow-up batches.
pub const ANCHOR_CHUNKS_PER_BATCH: usize = 5;

/// One batch of inputs to send, with the number of leading anchor inputs
/// whose embeddings must be discarded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedBatch {
    /// Texts to embed, anchors first.
    pub inputs: Vec<String>,
    /// Leading inputs that are anchors rather than payload chunks.
    pub anchor_count: usize,
}

/// Pack chunks into token-budgeted batches.
///
/// Anchors are the first up-to-five chunks; they are dropped entirely when
/// their combined estimate exceeds half the budget. A chunk whose own
/// estimate exceeds the budget is sent alone, without anchors.
pub(crate) fn plan_batches(
    max_tokens: usize,
    chunks: &[String],
    chars_per_token: usize,
) -> Vec<PlannedBatch> {
    let estimate = |text: &str| text.len() / chars_per_token.max(1);

    let mut anchors: Vec<String> = chunks
        .iter()
        .take(ANCHOR_CHUNKS_PER_BATCH)
        .cloned()
        .collect();
    let mut anchor_tokens: usize = anchors.iter().map(|c| estimate(c)).sum();
    if anchor_tokens > max_tokens / 2 {
        tracing::warn!(
            estimated_tokens = anchor_tokens,
            model_max_tokens = max_tokens,
            "Initial document chunks exceed half of estimated model token limit, skipping anchors"
        );
        anchors.clear();
        anchor_tokens = 0;
    }

    let mut batches: Vec<PlannedBatch> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_anchor_count = 0usize;
    let mut current_tokens = 0usize;

    for chunk in chunks {
        let chunk_tokens = estimate(chunk);

        if chunk_tokens > max_tokens {
            tracing::warn!(
                estimated_tokens = chunk_tokens,
                model_max_tokens = max_tokens,
                "Single document chunk exceeds estimated model token limit, sending alone"
            );
            if current.len() > current_anchor_count {
                batches.push(PlannedBatch {
                    inputs: std::mem::take(&mut current),
                    anchor_count: current_anchor_count,
                });
            } else {
                current.clear();
            }
            batches.push(PlannedBatch {
                inputs: vec![chunk.clone()],
                anchor_count: 0,
            });
            current = anchors.clone();
            current_anchor_count = anchors.len();
            current_tokens = anchor_tokens;
            continue;
        }

        if current.len() > current_anchor_count && current_tokens + chunk_tokens > max_tokens {
            batches.push(PlannedBatch {
                inputs: std::mem::take(&mut current),
                anchor_count: current_anchor_count,
            });
            current = anchors.clone();
            current.push(chunk.clone());
            current_anchor_count = anchors.len();
            current_tokens = anchor_tokens + chunk_tokens;
        } else {
            current.push(chunk.clone());
            current_tokens += chunk_tokens;
        }
    }

    if current.len() > current_anchor_count {
        batches.push(PlannedBatch {
            inputs: current,
            anchor_count: current_anchor_count,
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(tokens: usize, chars_per_token: usize, fill: char) -> String {
        std::iter::repeat_n(fill, tokens * chars_per_token).collect()
    }

    fn payload_count(batches: &[PlannedBatch]) -> usize {
        batches.iter().map(|b| b.inputs.len() - b.anchor_count).sum()
    }

    #[test]
    fn everything_fits_in_one_batch() {
        let chunks = vec!["abcd".to_string(), "efgh".to_string()];
        let batches = plan_batches(100, &chunks, 4);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].anchor_count, 0);
        assert_eq!(batches[0].inputs, chunks);
    }

    #[test]
    fn later_batches_carry_anchors() {
        // 20 one-token chunks against a 16-token budget: the second batch
        // starts with the five anchors plus the overflowing chunks.
        let chunks: Vec<String> = (0..20).map(|i| format!("c{i:02}x")).collect();
        let batches = plan_batches(16, &chunks, 4);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].anchor_count, 0);
        assert_eq!(batches[0].inputs.len(), 16);
        assert_eq!(batches[1].anchor_count, 5);
        assert_eq!(&batches[1].inputs[..5], &chunks[..5]);
        assert_eq!(&batches[1].inputs[5..], &chunks[16..]);
        assert_eq!(payload_count(&batches), 20);
    }

    #[test]
    fn heavy_anchors_are_dropped() {
        // Five 2-token anchors against a 4-token budget exceed half of it,
        // so follow-up batches get no anchors at all.
        let chunks: Vec<String> = (0..6).map(|_| chunk_of(2, 4, 'a')).collect();
        let batches = plan_batches(4, &chunks, 4);

        assert!(batches.len() > 1);
        assert!(batches.iter().all(|b| b.anchor_count == 0));
        assert_eq!(payload_count(&batches), 6);
    }

    #[test]
    fn oversized_chunk_goes_alone_without_anchors() {
        let mut chunks: Vec<String> = (0..3).map(|i| format!("s{i}xx")).collect();
        chunks.push(chunk_of(50, 4, 'z'));
        chunks.push("tail".to_string());
        let batches = plan_batches(16, &chunks, 4);

        let oversized = batches
            .iter()
            .find(|b| b.inputs.iter().any(|i| i.len() == 200))
            .expect("oversized chunk batch exists");
        assert_eq!(oversized.inputs.len(), 1);
        assert_eq!(oversized.anchor_count, 0);
        assert_eq!(payload_count(&batches), 5);
    }

    #[test]
    fn trailing_anchor_only_batch_is_not_emitted() {
        // The oversized chunk is last; the anchors staged for a follow-up
        // batch must not be flushed on their own.
        let mut chunks: Vec<String> = (0..3).map(|i| format!("s{i}xx")).collect();
        chunks.push(chunk_of(50, 4, 'z'));
        let batches = plan_batches(16, &chunks, 4);

        assert!(batches.iter().all(|b| b.inputs.len() > b.anchor_count));
        assert_eq!(payload_count(&batches), 4);
    }

    #[test]
    fn smaller_estimate_produces_more_batches() {
        let chunks: Vec<String> = (0..8).map(|_| chunk_of(2, 4, 'q')).collect();
        let coarse = plan_batches(16, &chunks, 4);
        let fine = plan_batches(16, &chunks, 1);
        assert!(fine.len() >= coarse.len());
        assert_eq!(payload_count(&coarse), 8);
        assert_eq!(payload_count(&fine), 8);
    }
}
