//! Context budget management
//!
//! Tracks a running token estimate against the provider's context
//! ceiling and chooses, per stage input, between verbatim admission and
//! model-driven adaptive summarization. Never silently drops required
//! data: when even compression cannot fit, the stage fails with a
//! handled budget error instead of truncating unpredictably.

use crate::error::EngineError;
use crate::models::ContextStrategy;
use crate::provider::ProviderAdapter;
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Approximate token count (4 chars per token heuristic).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Tokens reserved for model output when sizing the admissible input.
pub const DEFAULT_RESERVED_OUTPUT_TOKENS: usize = 8_192;

/// Running token budget for one run. The counter is the one piece of
/// mutable shared state, updated atomically so prior-period stages can
/// be parallelized by an implementer.
pub struct ContextBudgetManager {
    ceiling: usize,
    used: AtomicUsize,
}

impl ContextBudgetManager {
    /// Ceiling is the provider window minus the reserved output allowance.
    pub fn new(context_window: usize, reserved_output: usize) -> Self {
        Self {
            ceiling: context_window.saturating_sub(reserved_output),
            used: AtomicUsize::new(0),
        }
    }

    pub fn for_provider(provider: &dyn ProviderAdapter) -> Self {
        Self::new(provider.context_window(), DEFAULT_RESERVED_OUTPUT_TOKENS)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.ceiling.saturating_sub(self.used())
    }

    pub fn charge(&self, tokens: usize) {
        self.used.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Strategy the manager would use for a candidate input right now.
    pub fn choose_strategy(&self, candidate: &str) -> ContextStrategy {
        if estimate_tokens(candidate) <= self.remaining() {
            ContextStrategy::Standard
        } else {
            ContextStrategy::AdaptiveSummary
        }
    }

    /// Admit a stage input, compressing through the model when the
    /// verbatim text would exceed the remaining budget.
    pub async fn admit(
        &self,
        provider: &dyn ProviderAdapter,
        stage: &str,
        label: &str,
        text: &str,
        summary_cap_tokens: usize,
    ) -> Result<(String, ContextStrategy)> {
        let estimate = estimate_tokens(text);
        let remaining = self.remaining();

        if estimate <= remaining {
            self.charge(estimate);
            debug!(stage, label, tokens = estimate, "Admitted input verbatim");
            return Ok((text.to_string(), ContextStrategy::Standard));
        }

        let cap = summary_cap_tokens.min(remaining);
        if cap == 0 {
            return Err(EngineError::BudgetExceeded {
                stage: stage.to_string(),
                message: format!("no budget left to admit '{}'", label),
            });
        }

        info!(
            stage,
            label,
            tokens = estimate,
            remaining,
            cap,
            "Input exceeds remaining budget; summarizing"
        );

        let summary = provider
            .complete(SUMMARIZER_SYSTEM, &build_summary_prompt(label, text, cap))
            .await?;

        let summary_estimate = estimate_tokens(&summary);
        if summary_estimate > self.remaining() {
            warn!(
                stage,
                label,
                summary_tokens = summary_estimate,
                "Summary still exceeds remaining budget"
            );
            return Err(EngineError::BudgetExceeded {
                stage: stage.to_string(),
                message: format!(
                    "'{}' does not fit even after summarization ({} tokens over)",
                    label,
                    summary_estimate - self.remaining()
                ),
            });
        }

        self.charge(summary_estimate);
        Ok((summary, ContextStrategy::AdaptiveSummary))
    }
}

const SUMMARIZER_SYSTEM: &str = "You are an expert financial document summarizer. \
Preserve every number, ratio, and dated fact exactly as written; later \
analysis stages depend on them. Drop boilerplate and repetition only.";

fn build_summary_prompt(label: &str, text: &str, cap_tokens: usize) -> String {
    // ~4 chars per token, expressed as a word target for the model.
    let word_target = (cap_tokens * 3) / 4;
    format!(
        r#"Compress the following document ("{}") to at most {} words.
Keep all figures, percentages, and fiscal-year references verbatim.

DOCUMENT:
---
{}
---

COMPRESSED VERSION:"#,
        label, word_target, text
    )
}
