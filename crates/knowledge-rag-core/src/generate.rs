//! Answer generation boundary.
//!
//! The pipeline treats answer generation as injected behavior: an
//! [`AnswerGenerator`] receives the literal query text plus the assembled
//! context and returns an answer string. Network-backed generators live in
//! the app crate; [`ExtractiveGenerator`] works offline.

use async_trait::async_trait;

use crate::error::Result;

/// Answer returned when the context does not contain the answer.
pub const NO_ANSWER: &str = "I don't have enough information to answer this question.";

/// Input to a generator call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The user's question, verbatim.
    pub query: String,
    /// Assembled context block (may be empty).
    pub context: String,
    /// Completion model identifier.
    pub model: String,
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Short backend name, e.g. `"openai"`.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Instructions sent as the system message by chat-style generators.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant for a company. \
Answer the question based ONLY on the provided context. \
If you don't know the answer or it isn't in the context, say \
\"I don't have enough information to answer this question.\" \
When useful, mention the document the answer came from.";

/// Render the grounded-answer prompt for `query` over `context`.
pub fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "{}\n\nCONTEXT:\n{}\n\nQUESTION:\n{}\n\nANSWER:",
        SYSTEM_PROMPT, context, query
    )
}

/// Offline generator that answers with the top-ranked context block.
///
/// Useful for exercising the full pipeline without a completion model:
/// the answer is the body of the first block, or [`NO_ANSWER`] when the
/// context is empty.
#[derive(Debug, Default)]
pub struct ExtractiveGenerator;

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        Ok(first_block_body(&request.context)
            .map(str::to_string)
            .unwrap_or_else(|| NO_ANSWER.to_string()))
    }
}

/// Body of the first `--- Document: ... ---` block, if any.
fn first_block_body(context: &str) -> Option<&str> {
    let context = context.trim();
    if context.is_empty() {
        return None;
    }
    let body = match context.strip_prefix("--- Document:") {
        Some(rest) => rest.split_once('\n').map(|(_, b)| b).unwrap_or(""),
        None => context,
    };
    let end = body.find("\n\n--- Document:").unwrap_or(body.len());
    let body = body[..end].trim();
    (!body.is_empty()).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_parts() {
        let p = build_prompt("How is overtime paid?", "ctx text");
        assert!(p.contains("CONTEXT:\nctx text"));
        assert!(p.contains("QUESTION:\nHow is overtime paid?"));
        assert!(p.ends_with("ANSWER:"));
        assert!(p.contains(NO_ANSWER));
    }

    #[tokio::test]
    async fn test_extractive_uses_first_block() {
        let ctx = "--- Document: a.md | Section: Overtime ---\nPaid at 1.5x after 40 hours.\n\n--- Document: b.md | Section: X ---\nother";
        let answer = ExtractiveGenerator
            .generate(&GenerationRequest {
                query: "overtime pay rate".into(),
                context: ctx.into(),
                model: "m".into(),
            })
            .await
            .unwrap();
        assert_eq!(answer, "Paid at 1.5x after 40 hours.");
    }

    #[tokio::test]
    async fn test_extractive_empty_context() {
        let answer = ExtractiveGenerator
            .generate(&GenerationRequest {
                query: "q".into(),
                context: String::new(),
                model: "m".into(),
            })
            .await
            .unwrap();
        assert_eq!(answer, NO_ANSWER);
    }
}
