//! Context assembly for the generation step.
//!
//! Formats ranked chunks into one bounded block of text, each chunk
//! preceded by a provenance header:
//!
//! ```text
//! --- Document: hr/overtime.md | Section: Pay > Overtime ---
//! Paid at 1.5x after 40 hours.
//! ```
//!
//! Chunks are never cut. Whole chunks are dropped from the tail of the list
//! once the next one would push the total past the limit, and a chunk that
//! could never fit on its own is skipped.

use crate::models::RetrievedChunk;

const BLOCK_SEPARATOR: &str = "\n\n";

/// Assembled context plus the fingerprints of the chunks it contains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub included: Vec<String>,
}

/// Format `results` (already in relevance order) into at most
/// `max_length` characters, reporting which chunks were included.
pub fn assemble_context(results: &[RetrievedChunk], max_length: usize) -> AssembledContext {
    let mut out = AssembledContext::default();
    let mut total = 0usize;

    for hit in results {
        let block = format_block(hit);
        let block_len = block.chars().count();
        if block_len > max_length {
            continue;
        }
        let sep_len = if out.text.is_empty() {
            0
        } else {
            BLOCK_SEPARATOR.len()
        };
        if total + sep_len + block_len > max_length {
            break;
        }
        if sep_len > 0 {
            out.text.push_str(BLOCK_SEPARATOR);
        }
        out.text.push_str(&block);
        total += sep_len + block_len;
        out.included.push(hit.fingerprint.clone());
    }
    out
}

/// Provenance header followed by the chunk text.
pub fn format_block(hit: &RetrievedChunk) -> String {
    let meta = &hit.metadata;
    let section = if meta.heading_path.is_empty() {
        meta.title.clone()
    } else {
        meta.section_label()
    };
    let also = if meta.also_covers.is_empty() {
        String::new()
    } else {
        format!(" (Also covers: {})", meta.also_covers.join(", "))
    };
    format!(
        "--- Document: {} | Section: {}{} ---\n{}",
        meta.source, section, also, hit.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn hit(fp: &str, score: f32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            fingerprint: fp.into(),
            score,
            text: text.into(),
            metadata: ChunkMetadata {
                source: "a.md".into(),
                title: "A".into(),
                heading_path: vec!["S".into()],
                chunk_index: 0,
                char_len: text.chars().count(),
                also_covers: Vec::new(),
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn test_oversized_second_chunk_excluded() {
        let results = vec![hit("one", 0.9, &"a".repeat(50)), hit("two", 0.8, &"b".repeat(9000))];
        let ctx = assemble_context(&results, 100);
        assert_eq!(ctx.included, vec!["one"]);
        assert!(ctx.text.contains(&"a".repeat(50)));
        assert!(!ctx.text.contains('b'));
        assert!(ctx.text.chars().count() <= 100);
    }

    #[test]
    fn test_empty_results_empty_context() {
        assert_eq!(assemble_context(&[], 1000).text, "");
    }

    #[test]
    fn test_header_format() {
        let mut h = hit("x", 1.0, "Paid at 1.5x after 40 hours.");
        h.metadata.heading_path = vec!["Pay".into(), "Overtime".into()];
        h.metadata.also_covers = vec!["Holidays".into()];
        assert_eq!(
            format_block(&h),
            "--- Document: a.md | Section: Pay > Overtime (Also covers: Holidays) ---\nPaid at 1.5x after 40 hours."
        );
    }

    #[test]
    fn test_stops_at_budget_keeping_order() {
        let results: Vec<RetrievedChunk> = (0..10)
            .map(|i| hit(&format!("fp{}", i), 1.0 - i as f32 * 0.1, &"z".repeat(40)))
            .collect();
        let ctx = assemble_context(&results, 200);
        assert!(ctx.text.chars().count() <= 200);
        assert_eq!(ctx.included, vec!["fp0", "fp1"]);
    }

    #[test]
    fn test_skipped_block_does_not_stop_assembly() {
        let results = vec![hit("big", 0.9, &"b".repeat(500)), hit("small", 0.5, "ok")];
        let ctx = assemble_context(&results, 100);
        assert_eq!(ctx.included, vec!["small"]);
    }
}
