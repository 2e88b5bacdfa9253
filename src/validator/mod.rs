//! Validation and refinement loop
//!
//! Two validation tiers run over a draft result: deterministic rules
//! (ranges, cross-field consistency, completeness, trend claims against
//! the per-period numbers) and a second-model critic pass that returns a
//! quality score plus findings. Fixable findings drive a bounded
//! refinement cycle of exact-span narrative patches followed by
//! re-derivation of the structured fields from the merged text.

use crate::cache::{CachingExecutor, ToolCache, ToolFamily};
use crate::extractor::{apply_cached_overrides, StructuredExtractor};
use crate::models::{
    bounds, AnalysisResult, Decision, FindingCategory, MetricField, Metrics, MoatStrength,
    RiskRating, RunOutcome, Severity, TokenUsage, ValidationFinding, ValidationPass,
};
use crate::provider::{AgenticRequest, ProviderAdapter};
use crate::tools::ToolRegistry;
use crate::Result;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refinement passes before the loop gives up.
pub const MAX_REFINEMENT_PASSES: u32 = 3;
/// Critic score at or above which the result is accepted as-is.
pub const SCORE_THRESHOLD: f64 = 80.0;

//
// ================= Deterministic rules =================
//

/// One deterministic validation rule. Rules are pure: they read the
/// draft result and report findings, never mutate it.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding>;
}

fn finding(
    severity: Severity,
    category: FindingCategory,
    message: String,
    fixable: bool,
) -> ValidationFinding {
    ValidationFinding {
        severity,
        category,
        message,
        fixable,
    }
}

/// Every populated metric must still sit inside its declared range.
/// Assignment already enforces this; the rule re-checks results that
/// arrived through deserialization.
pub struct MetricRangeRule;

impl MetricRangeRule {
    fn check_metrics(scope: &str, metrics: &Metrics, out: &mut Vec<ValidationFinding>) {
        for field in MetricField::ALL {
            let Some(value) = metrics.get(*field) else {
                continue;
            };
            let (lo, hi) = field.range();
            if !value.is_finite() || value < lo || value > hi {
                out.push(finding(
                    Severity::Error,
                    FindingCategory::Range,
                    format!(
                        "{}: {} = {} outside declared range [{}, {}]",
                        scope,
                        field.name(),
                        value,
                        lo,
                        hi
                    ),
                    true,
                ));
            }
        }
    }
}

impl ValidationRule for MetricRangeRule {
    fn name(&self) -> &'static str {
        "metric_range"
    }

    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding> {
        let mut out = Vec::new();
        Self::check_metrics("final result", &result.numeric_highlights, &mut out);
        for period in &result.periods {
            Self::check_metrics(&period.period_id, &period.metrics, &mut out);
        }
        out
    }
}

/// Margins must be ordered gross >= operating >= net, within tolerance.
/// A violation names both offending fields so a patch can target them.
pub struct MarginOrderingRule;

impl MarginOrderingRule {
    fn check_metrics(scope: &str, metrics: &Metrics, out: &mut Vec<ValidationFinding>) {
        let tol = bounds::MARGIN_ORDER_TOLERANCE;
        let pairs = [
            (MetricField::OperatingMargin, MetricField::GrossMargin),
            (MetricField::NetMargin, MetricField::OperatingMargin),
        ];
        for (smaller, larger) in pairs {
            if let (Some(s), Some(l)) = (metrics.get(smaller), metrics.get(larger)) {
                if s > l + tol {
                    out.push(finding(
                        Severity::Error,
                        FindingCategory::Consistency,
                        format!(
                            "{}: {} ({:.4}) exceeds {} ({:.4})",
                            scope,
                            smaller.name(),
                            s,
                            larger.name(),
                            l
                        ),
                        true,
                    ));
                }
            }
        }
    }
}

impl ValidationRule for MarginOrderingRule {
    fn name(&self) -> &'static str {
        "margin_ordering"
    }

    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding> {
        let mut out = Vec::new();
        Self::check_metrics("final result", &result.numeric_highlights, &mut out);
        for period in &result.periods {
            Self::check_metrics(&period.period_id, &period.metrics, &mut out);
        }
        out
    }
}

/// A BUY call sitting on top of contradicting qualitative ratings is a
/// judgment problem, flagged but not machine-fixable.
pub struct DecisionConsistencyRule;

impl ValidationRule for DecisionConsistencyRule {
    fn name(&self) -> &'static str {
        "decision_consistency"
    }

    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding> {
        let mut out = Vec::new();
        if result.decision != Some(Decision::Buy) {
            return out;
        }

        let latest_insights = result.periods.last().map(|p| &p.insights);
        let moat = latest_insights.and_then(|i| i.moat);
        let risk = latest_insights.and_then(|i| i.risk);

        if moat == Some(MoatStrength::None) {
            out.push(finding(
                Severity::Warning,
                FindingCategory::Consistency,
                "BUY decision with no identified moat".to_string(),
                false,
            ));
        }
        if risk == Some(RiskRating::High) {
            out.push(finding(
                Severity::Warning,
                FindingCategory::Consistency,
                "BUY decision with high risk rating".to_string(),
                false,
            ));
        }
        if let Some(mos) = result.numeric_highlights.margin_of_safety {
            if mos < 0.0 {
                out.push(finding(
                    Severity::Warning,
                    FindingCategory::Consistency,
                    format!("BUY decision with negative margin of safety ({:.2})", mos),
                    false,
                ));
            }
        }
        out
    }
}

/// The result must carry the conclusions a reader paid for.
pub struct CompletenessRule;

impl ValidationRule for CompletenessRule {
    fn name(&self) -> &'static str {
        "completeness"
    }

    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding> {
        let mut out = Vec::new();
        if result.decision.is_none() {
            out.push(finding(
                Severity::Error,
                FindingCategory::Completeness,
                "no BUY/WATCH/AVOID decision present".to_string(),
                true,
            ));
        }
        if result.narrative.trim().is_empty() {
            out.push(finding(
                Severity::Error,
                FindingCategory::Completeness,
                "narrative is empty".to_string(),
                true,
            ));
        }
        if result.conviction.is_none() {
            out.push(finding(
                Severity::Warning,
                FindingCategory::Completeness,
                "no conviction level present".to_string(),
                true,
            ));
        }
        if result.numeric_highlights.is_empty() {
            out.push(finding(
                Severity::Warning,
                FindingCategory::Completeness,
                "no numeric highlights extracted".to_string(),
                true,
            ));
        }
        out
    }
}

/// Directional margin claims in the narrative checked against the actual
/// per-period operating margin deltas.
pub struct TrendClaimRule {
    improving: Regex,
    declining: Regex,
}

impl TrendClaimRule {
    pub fn new() -> Self {
        Self {
            improving: Regex::new(
                r"(?i)(?:margins?\s+(?:are\s+|have\s+been\s+)?(?:expand|improv|widen)\w*|(?:expanding|improving|widening)\s+margins?|margin\s+expansion)",
            )
            .expect("static trend pattern"),
            declining: Regex::new(
                r"(?i)(?:margins?\s+(?:are\s+|have\s+been\s+)?(?:contract|compress|declin|erod|deteriorat)\w*|(?:contracting|compressing|declining|eroding)\s+margins?|margin\s+(?:compression|erosion))",
            )
            .expect("static trend pattern"),
        }
    }

    /// Operating margin delta from the earliest to the latest populated
    /// period, in chronological order.
    fn margin_delta(result: &AnalysisResult) -> Option<f64> {
        let mut populated: Vec<(&str, f64)> = result
            .periods
            .iter()
            .filter_map(|p| p.metrics.operating_margin.map(|m| (p.period_id.as_str(), m)))
            .collect();
        if populated.len() < 2 {
            return None;
        }
        populated.sort_by(|a, b| a.0.cmp(b.0));
        Some(populated.last()?.1 - populated.first()?.1)
    }
}

impl Default for TrendClaimRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationRule for TrendClaimRule {
    fn name(&self) -> &'static str {
        "trend_claim"
    }

    fn check(&self, result: &AnalysisResult) -> Vec<ValidationFinding> {
        let mut out = Vec::new();
        let Some(delta) = Self::margin_delta(result) else {
            return out;
        };
        let tol = bounds::MARGIN_ORDER_TOLERANCE;

        if self.improving.is_match(&result.narrative) && delta < -tol {
            out.push(finding(
                Severity::Warning,
                FindingCategory::TrendClaim,
                format!(
                    "narrative claims improving margins but operating margin moved {:+.4} across periods",
                    delta
                ),
                true,
            ));
        }
        if self.declining.is_match(&result.narrative) && delta > tol {
            out.push(finding(
                Severity::Warning,
                FindingCategory::TrendClaim,
                format!(
                    "narrative claims declining margins but operating margin moved {:+.4} across periods",
                    delta
                ),
                true,
            ));
        }
        out
    }
}

pub fn default_rules() -> Vec<Box<dyn ValidationRule>> {
    vec![
        Box::new(MetricRangeRule),
        Box::new(MarginOrderingRule),
        Box::new(DecisionConsistencyRule),
        Box::new(CompletenessRule),
        Box::new(TrendClaimRule::new()),
    ]
}

//
// ================= Span edits =================
//

/// One exact-span narrative patch proposed by the refinement model. The
/// find text must occur verbatim; nothing is guessed structurally.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanEdit {
    pub find: String,
    pub replace: String,
}

/// Apply edits by exact substring replacement, first occurrence only.
/// Returns how many edits actually landed.
pub fn apply_span_edits(narrative: &mut String, edits: &[SpanEdit]) -> usize {
    let mut applied = 0;
    for edit in edits {
        if edit.find.is_empty() {
            continue;
        }
        if narrative.contains(&edit.find) {
            *narrative = narrative.replacen(&edit.find, &edit.replace, 1);
            applied += 1;
        } else {
            debug!(find = %edit.find, "Span edit target not found; skipped");
        }
    }
    applied
}

//
// ================= Refinement loop =================
//

/// Runs validation passes and bounded refinement over a draft result.
/// Structured fields are only ever updated by re-deriving them from the
/// patched narrative and merging; present values are never nulled.
pub struct ValidatorRefinementLoop {
    critic: Arc<dyn ProviderAdapter>,
    refiner: Arc<dyn ProviderAdapter>,
    registry: Arc<ToolRegistry>,
    rules: Vec<Box<dyn ValidationRule>>,
    extractor: StructuredExtractor,
}

impl ValidatorRefinementLoop {
    pub fn new(
        critic: Arc<dyn ProviderAdapter>,
        refiner: Arc<dyn ProviderAdapter>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            critic,
            refiner,
            registry,
            rules: default_rules(),
            extractor: StructuredExtractor::new(),
        }
    }

    /// Validate and refine until the score clears the threshold, no
    /// fixable findings remain, or the pass cap is reached. Sets
    /// `result.outcome` and appends to `result.validation_history`.
    pub async fn run(&self, result: &mut AnalysisResult, cache: &ToolCache) -> Result<()> {
        let mut last_score = 0.0;

        for iteration in 1..=MAX_REFINEMENT_PASSES {
            let mut findings: Vec<ValidationFinding> = self
                .rules
                .iter()
                .flat_map(|rule| rule.check(result))
                .collect();

            let (score, critic_findings) = self.critic_pass(result, &findings, cache).await?;
            findings.extend(critic_findings);
            if let Some(s) = score {
                last_score = s;
            }

            let fixable: Vec<ValidationFinding> =
                findings.iter().filter(|f| f.fixable).cloned().collect();
            let unfixable_error = findings
                .iter()
                .any(|f| f.severity == Severity::Error && !f.fixable);
            let score_ok = score.map_or(false, |s| s >= SCORE_THRESHOLD);

            let mut pass = ValidationPass {
                iteration,
                findings: findings.clone(),
                score,
                patch_applied: false,
                created_at: Utc::now(),
            };

            if score_ok || fixable.is_empty() {
                result.validation_history.push(pass);
                result.outcome = if unfixable_error {
                    RunOutcome::Unfixable
                } else {
                    RunOutcome::Accepted
                };
                info!(
                    iteration,
                    score = ?score,
                    outcome = ?result.outcome,
                    "Validation loop terminated"
                );
                return Ok(());
            }

            if iteration == MAX_REFINEMENT_PASSES {
                result.validation_history.push(pass);
                break;
            }

            let (edits, usage) = self.refinement_pass(result, &fixable, cache).await?;
            result.token_usage.add(usage);
            let applied = apply_span_edits(&mut result.narrative, &edits);
            pass.patch_applied = applied > 0;
            result.validation_history.push(pass);
            info!(iteration, proposed = edits.len(), applied, "Refinement pass");

            if applied > 0 {
                self.rederive(result, cache).await;
            }
        }

        result.outcome = RunOutcome::MaxIterationsReached { score: last_score };
        Ok(())
    }

    /// Re-derive structured fields from the merged narrative. Merge only:
    /// a field the re-extraction does not produce keeps its prior value.
    async fn rederive(&self, result: &mut AnalysisResult, cache: &ToolCache) {
        let extraction = self.extractor.extract_lenient(&result.narrative);
        let mut derived = extraction.metrics;
        apply_cached_overrides(&mut derived, cache, None).await;

        result.numeric_highlights.merge_preferring(&derived);
        if extraction.insights.decision.is_some() {
            result.decision = extraction.insights.decision;
        }
        if extraction.insights.conviction.is_some() {
            result.conviction = extraction.insights.conviction;
        }
    }

    async fn critic_pass(
        &self,
        result: &AnalysisResult,
        deterministic: &[ValidationFinding],
        cache: &ToolCache,
    ) -> Result<(Option<f64>, Vec<ValidationFinding>)> {
        let prompt = build_critic_prompt(result, deterministic, &cache_digest(cache).await)?;
        let raw = self.critic.complete(CRITIC_SYSTEM, &prompt).await?;

        match parse_critic_reply(&raw) {
            Some((score, findings)) => Ok((Some(score), findings)),
            None => {
                warn!("Unparseable critic reply; continuing without a score");
                Ok((None, Vec::new()))
            }
        }
    }

    async fn refinement_pass(
        &self,
        result: &AnalysisResult,
        fixable: &[ValidationFinding],
        cache: &ToolCache,
    ) -> Result<(Vec<SpanEdit>, TokenUsage)> {
        let prompt = build_refine_prompt(result, fixable);
        let executor = CachingExecutor::new(cache, &self.registry);
        let specs = self.registry.specs();

        let outcome = self
            .refiner
            .run_agentic_loop(
                AgenticRequest {
                    system_prompt: REFINER_SYSTEM,
                    initial_message: &prompt,
                    tools: &specs,
                    cancelled: None,
                },
                &executor,
            )
            .await?;

        let edits = parse_span_edits(&outcome.text);
        Ok((edits, outcome.usage))
    }
}

//
// ================= Prompts and parsing =================
//

const CRITIC_SYSTEM: &str = "You are a skeptical senior investment analyst reviewing a \
colleague's draft. Judge factual grounding, internal consistency, and whether the \
conclusion follows from the evidence. Treat the supplied tool-computed values as ground \
truth. Reply with a JSON object only: \
{\"score\": 0-100, \"findings\": [{\"severity\": \"warning\"|\"error\", \
\"message\": \"...\", \"fixable\": true|false}]}. A finding is fixable when a targeted \
text correction or one more tool call would resolve it.";

const REFINER_SYSTEM: &str = "You repair a draft investment narrative. For each reported \
issue, propose the smallest exact-text correction. You may call tools to recompute \
values. Reply with a JSON array only: [{\"find\": \"exact text in the draft\", \
\"replace\": \"corrected text\"}]. The find text must be copied verbatim from the draft.";

fn build_critic_prompt(
    result: &AnalysisResult,
    deterministic: &[ValidationFinding],
    digest: &str,
) -> Result<String> {
    let summary = serde_json::to_string_pretty(&serde_json::json!({
        "subject": result.subject,
        "decision": result.decision,
        "conviction": result.conviction,
        "numeric_highlights": result.numeric_highlights,
        "periods_analyzed": result.periods.len(),
        "period_gaps": result.period_gaps.len(),
    }))?;

    let mut issues = String::new();
    for f in deterministic {
        issues.push_str(&format!("- [{:?}] {}\n", f.severity, f.message));
    }
    if issues.is_empty() {
        issues.push_str("(none)\n");
    }

    Ok(format!(
        r#"DRAFT SUMMARY:
{}

TOOL-COMPUTED VALUES (ground truth):
{}

AUTOMATED CHECKS ALREADY FLAGGED:
{}
NARRATIVE:
---
{}
---"#,
        summary, digest, issues, result.narrative
    ))
}

fn build_refine_prompt(result: &AnalysisResult, fixable: &[ValidationFinding]) -> String {
    let mut issues = String::new();
    for f in fixable {
        issues.push_str(&format!("- {}\n", f.message));
    }
    format!(
        r#"ISSUES TO FIX:
{}
DRAFT:
---
{}
---"#,
        issues, result.narrative
    )
}

/// Digest of successful tool-computed values for the critic. Read-only
/// view of the run cache; the critic never executes tools.
async fn cache_digest(cache: &ToolCache) -> String {
    let mut lines = Vec::new();
    for family in [ToolFamily::Calculator, ToolFamily::MarketData] {
        for record in cache.successful_in_family(family).await {
            let mut payload = record.payload.to_string();
            if payload.len() > 240 {
                payload.truncate(240);
            }
            lines.push(format!("- {}: {}", record.tool_name, payload));
        }
    }
    if lines.is_empty() {
        lines.push("(no tool results cached)".to_string());
    }
    lines.sort();
    lines.join("\n")
}

fn parse_critic_reply(raw: &str) -> Option<(f64, Vec<ValidationFinding>)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let value: Value = serde_json::from_str(&raw[start..=end]).ok()?;

    let score = value.get("score")?.as_f64()?;
    let mut findings = Vec::new();
    if let Some(items) = value.get("findings").and_then(Value::as_array) {
        for item in items {
            let Some(message) = item.get("message").and_then(Value::as_str) else {
                continue;
            };
            let severity = match item.get("severity").and_then(Value::as_str) {
                Some("error") => Severity::Error,
                _ => Severity::Warning,
            };
            let fixable = item
                .get("fixable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            findings.push(finding(
                severity,
                FindingCategory::Critic,
                message.to_string(),
                fixable,
            ));
        }
    }
    Some((score.clamp(0.0, 100.0), findings))
}

fn parse_span_edits(raw: &str) -> Vec<SpanEdit> {
    let Some(start) = raw.find('[') else {
        return Vec::new();
    };
    let Some(end) = raw.rfind(']') else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<SpanEdit>>(&raw[start..=end]) {
        Ok(edits) => edits,
        Err(e) => {
            warn!("Unparseable span edits: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextStrategy, Insights, PeriodAnalysis};
    use crate::provider::{ScriptedProvider, ScriptedReply};
    use crate::tools::create_stub_registry;

    fn period(id: &str, operating_margin: f64) -> PeriodAnalysis {
        let mut metrics = Metrics::default();
        metrics
            .set(MetricField::OperatingMargin, operating_margin)
            .unwrap();
        PeriodAnalysis {
            period_id: id.to_string(),
            narrative: String::new(),
            metrics,
            insights: Insights::default(),
            tool_calls_made: 0,
            token_estimate: 0,
            strategy: ContextStrategy::Standard,
        }
    }

    fn draft() -> AnalysisResult {
        let mut result = AnalysisResult::new("ACME");
        result.decision = Some(Decision::Buy);
        result.narrative = "Solid operator with durable demand.".to_string();
        result
            .numeric_highlights
            .set(MetricField::GrossMargin, 0.55)
            .unwrap();
        result
    }

    fn loop_with(
        critic_replies: Vec<ScriptedReply>,
        refiner_replies: Vec<ScriptedReply>,
    ) -> ValidatorRefinementLoop {
        ValidatorRefinementLoop::new(
            Arc::new(ScriptedProvider::new(critic_replies)),
            Arc::new(ScriptedProvider::new(refiner_replies)),
            Arc::new(create_stub_registry()),
        )
    }

    #[test]
    fn test_margin_ordering_violation_names_both_fields() {
        let mut result = draft();
        result
            .numeric_highlights
            .set(MetricField::GrossMargin, 0.30)
            .unwrap();
        result
            .numeric_highlights
            .set(MetricField::OperatingMargin, 0.50)
            .unwrap();

        let findings = MarginOrderingRule.check(&result);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
        assert!(findings[0].message.contains("operating_margin"));
        assert!(findings[0].message.contains("gross_margin"));
        assert!(findings[0].fixable);
    }

    #[test]
    fn test_margin_ordering_within_tolerance_passes() {
        let mut result = draft();
        result
            .numeric_highlights
            .set(MetricField::GrossMargin, 0.300)
            .unwrap();
        result
            .numeric_highlights
            .set(MetricField::OperatingMargin, 0.303)
            .unwrap();
        assert!(MarginOrderingRule.check(&result).is_empty());
    }

    #[test]
    fn test_trend_claim_contradiction_is_flagged() {
        let mut result = draft();
        result.narrative = "Margins are expanding every year.".to_string();
        result.periods = vec![period("FY2021", 0.35), period("FY2023", 0.28)];

        let findings = TrendClaimRule::new().check(&result);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, FindingCategory::TrendClaim);
        assert!(findings[0].message.contains("-0.07"));
    }

    #[test]
    fn test_completeness_requires_a_decision() {
        let mut result = draft();
        result.decision = None;
        let findings = CompletenessRule.check(&result);
        assert!(findings
            .iter()
            .any(|f| f.severity == Severity::Error && f.message.contains("decision")));
    }

    #[test]
    fn test_span_edits_apply_exact_first_occurrence_only() {
        let mut narrative = "ROIC near 22%. The 22% figure drives the thesis.".to_string();
        let applied = apply_span_edits(
            &mut narrative,
            &[
                SpanEdit {
                    find: "ROIC near 22%".to_string(),
                    replace: "ROIC near 18%".to_string(),
                },
                SpanEdit {
                    find: "not present anywhere".to_string(),
                    replace: "x".to_string(),
                },
            ],
        );
        assert_eq!(applied, 1);
        assert!(narrative.starts_with("ROIC near 18%"));
        // Second occurrence of the bare figure untouched.
        assert!(narrative.contains("The 22% figure"));
    }

    #[tokio::test]
    async fn test_high_score_without_fixables_accepts_in_one_pass() {
        let validator = loop_with(
            vec![ScriptedReply::text_only(r#"{"score": 92, "findings": []}"#)],
            vec![],
        );
        let mut result = draft();
        result.conviction = Some(crate::models::Conviction::High);

        validator.run(&mut result, &ToolCache::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Accepted);
        assert_eq!(result.validation_history.len(), 1);
        assert_eq!(result.validation_history[0].score, Some(92.0));
    }

    #[tokio::test]
    async fn test_refinement_patch_preserves_unmentioned_fields() {
        // Pass 1: low score with a fixable finding; refiner patches one
        // span. Pass 2: clean. The decision is never mentioned by any
        // patch and must survive.
        let critic_replies = vec![
            ScriptedReply::text_only(
                r#"{"score": 60, "findings": [{"severity": "warning", "message": "ROIC figure contradicts the cached calculation", "fixable": true}]}"#,
            ),
            ScriptedReply::text_only(r#"{"score": 90, "findings": []}"#),
        ];
        let refiner_replies = vec![ScriptedReply::text_only(
            r#"[{"find": "ROIC near 22%", "replace": "ROIC near 18%"}]"#,
        )];
        let validator = loop_with(critic_replies, refiner_replies);

        let mut result = draft();
        result.conviction = Some(crate::models::Conviction::Moderate);
        result.narrative = "Durable franchise with ROIC near 22% and stable demand.".to_string();

        validator.run(&mut result, &ToolCache::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Accepted);
        assert!(result.narrative.contains("ROIC near 18%"));
        assert_eq!(result.validation_history.len(), 2);
        assert!(result.validation_history[0].patch_applied);
        // Merge guard: untouched structured fields keep their values.
        assert_eq!(result.decision, Some(Decision::Buy));
        assert_eq!(result.conviction, Some(crate::models::Conviction::Moderate));
        assert_eq!(result.numeric_highlights.gross_margin, Some(0.55));
    }

    #[tokio::test]
    async fn test_unfixable_error_terminates_with_quality_warning() {
        let validator = loop_with(
            vec![ScriptedReply::text_only(
                r#"{"score": 85, "findings": [{"severity": "error", "message": "thesis rests on an unverifiable private dataset", "fixable": false}]}"#,
            )],
            vec![],
        );
        let mut result = draft();
        result.conviction = Some(crate::models::Conviction::Low);

        validator.run(&mut result, &ToolCache::new()).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Unfixable);
    }

    #[tokio::test]
    async fn test_pass_cap_yields_max_iterations_outcome() {
        let low = r#"{"score": 50, "findings": [{"severity": "warning", "message": "valuation section remains unsupported", "fixable": true}]}"#;
        let critic_replies = vec![
            ScriptedReply::text_only(low),
            ScriptedReply::text_only(low),
            ScriptedReply::text_only(low),
        ];
        // Refiner never produces a parseable patch.
        let refiner_replies = vec![
            ScriptedReply::text_only("I cannot produce edits."),
            ScriptedReply::text_only("Still no edits."),
        ];
        let validator = loop_with(critic_replies, refiner_replies);

        let mut result = draft();
        result.conviction = Some(crate::models::Conviction::Low);

        validator.run(&mut result, &ToolCache::new()).await.unwrap();

        assert_eq!(
            result.outcome,
            RunOutcome::MaxIterationsReached { score: 50.0 }
        );
        assert_eq!(result.validation_history.len(), MAX_REFINEMENT_PASSES as usize);
        assert!(!result.validation_history[0].patch_applied);
    }
}
