//! Multi-stage analysis orchestration
//!
//! Drives one run through its fixed stage sequence: the current fiscal
//! period, each prior period oldest-last, a cross-period synthesis, and
//! the validation loop. Every piece of run state (cache, budget,
//! accumulated periods) lives in the per-run context; two concurrent
//! runs share nothing.

use crate::budget::{estimate_tokens, ContextBudgetManager};
use crate::cache::{CachingExecutor, ToolCache};
use crate::error::EngineError;
use crate::extractor::{apply_cached_overrides, Extraction, StructuredExtractor};
use crate::models::{
    AnalysisResult, PeriodAnalysis, PeriodGap, ProgressCallback, RunOutcome, StageProgress,
    TokenUsage, ToolInput,
};
use crate::provider::{AgenticRequest, ProviderAdapter, ToolExecutor};
use crate::tools::ToolRegistry;
use crate::validator::ValidatorRefinementLoop;
use crate::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Hard cap on prior periods per run.
pub const MAX_PRIOR_PERIODS: usize = 10;
/// Token cap handed to the budget manager when a stage input needs
/// adaptive summarization.
const SUMMARY_CAP_TOKENS: usize = 2_048;

//
// ================= Request =================
//

/// Parameters for one analysis run.
pub struct AnalysisRequest {
    pub subject: String,
    pub current_fiscal_year: i64,
    pub prior_periods: usize,
    /// Cooperative cancellation; checked at stage boundaries and between
    /// tool-call iterations.
    pub cancelled: Option<Arc<AtomicBool>>,
}

impl AnalysisRequest {
    pub fn new(subject: impl Into<String>, current_fiscal_year: i64) -> Self {
        Self {
            subject: subject.into(),
            current_fiscal_year,
            prior_periods: 4,
            cancelled: None,
        }
    }

    pub fn with_prior_periods(mut self, count: usize) -> Self {
        self.prior_periods = count;
        self
    }

    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(flag);
        self
    }
}

/// Mutable state owned by a single run.
struct RunContext {
    cache: ToolCache,
    budget: ContextBudgetManager,
}

//
// ================= Orchestrator =================
//

/// Owns the stage sequence for analysis runs. Holds provider seams and
/// the tool registry; all per-run state is constructed inside
/// [`analyze`](Self::analyze).
pub struct StageOrchestrator {
    provider: Arc<dyn ProviderAdapter>,
    critic_provider: Arc<dyn ProviderAdapter>,
    registry: Arc<ToolRegistry>,
    extractor: StructuredExtractor,
    progress: Option<ProgressCallback>,
}

impl StageOrchestrator {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        critic_provider: Arc<dyn ProviderAdapter>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            critic_provider,
            registry,
            extractor: StructuredExtractor::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Run a full analysis. Fatal errors do not surface as raw errors:
    /// they become a `Failed` outcome carrying the stage and cause, with
    /// whatever periods completed before the failure still attached.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult> {
        let prior_count = request.prior_periods.min(MAX_PRIOR_PERIODS);
        let ctx = RunContext {
            cache: ToolCache::new(),
            budget: ContextBudgetManager::for_provider(self.provider.as_ref()),
        };
        let mut result = AnalysisResult::new(&request.subject);
        let total_stages = (prior_count + 3) as f32;

        info!(
            subject = %request.subject,
            run_id = %result.run_id,
            prior_periods = prior_count,
            "Starting analysis run"
        );

        // Current period. Without it there is nothing to synthesize, so
        // an unavailable current-year document fails the run.
        self.report("current_period", 0.0, "Analyzing current fiscal period");
        match self
            .run_period_stage(&ctx, &request, request.current_fiscal_year, "current_period")
            .await
        {
            Ok((period, usage)) => {
                result.token_usage.add(usage);
                result.periods.push(period);
            }
            Err(e) => return Ok(self.fail(result, "current_period", e, &ctx).await),
        }

        // Speculative warm-up for the lookups the prior stages and
        // synthesis are likely to issue.
        let prior_years: Vec<i64> = (1..=prior_count as i64)
            .map(|i| request.current_fiscal_year - i)
            .collect();
        ctx.cache
            .warm(&request.subject, &prior_years, &self.registry)
            .await;

        for (idx, year) in prior_years.iter().enumerate() {
            let stage = format!("prior_period_{}", idx + 1);
            self.report(
                &stage,
                (idx + 1) as f32 / total_stages,
                format!("Analyzing {}", period_label(*year)),
            );

            match self.run_period_stage(&ctx, &request, *year, &stage).await {
                Ok((period, usage)) => {
                    result.token_usage.add(usage);
                    result.periods.push(period);
                }
                Err(e) if e.is_fatal() => return Ok(self.fail(result, &stage, e, &ctx).await),
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Skipping prior period");
                    result.period_gaps.push(PeriodGap {
                        period_id: period_label(*year),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.report(
            "synthesis",
            (prior_count + 1) as f32 / total_stages,
            "Synthesizing across periods",
        );
        match self.run_synthesis_stage(&ctx, &request, &mut result).await {
            Ok(usage) => result.token_usage.add(usage),
            Err(e) => return Ok(self.fail(result, "synthesis", e, &ctx).await),
        }

        self.report(
            "validation",
            (prior_count + 2) as f32 / total_stages,
            "Validating and refining",
        );
        let validator = ValidatorRefinementLoop::new(
            self.critic_provider.clone(),
            self.provider.clone(),
            self.registry.clone(),
        );
        if let Err(e) = validator.run(&mut result, &ctx.cache).await {
            return Ok(self.fail(result, "validation", e, &ctx).await);
        }

        result.cache_stats = Some(ctx.cache.stats().await);
        self.report("done", 1.0, "Analysis complete");
        info!(
            run_id = %result.run_id,
            outcome = ?result.outcome,
            periods = result.periods.len(),
            gaps = result.period_gaps.len(),
            tokens = result.token_usage.total(),
            "Analysis run finished"
        );
        Ok(result)
    }

    /// Analyze one fiscal period: retrieve and admit the source
    /// document, run the agentic loop, extract, and overlay cached
    /// tool-computed values for that year.
    async fn run_period_stage(
        &self,
        ctx: &RunContext,
        request: &AnalysisRequest,
        year: i64,
        stage: &str,
    ) -> Result<(PeriodAnalysis, TokenUsage)> {
        self.check_cancelled(request, stage)?;

        let executor = CachingExecutor::new(&ctx.cache, &self.registry);
        let filing = executor
            .execute(&ToolInput {
                tool_name: "filing_excerpt".to_string(),
                parameters: json!({
                    "symbol": request.subject,
                    "fiscal_year": year,
                }),
            })
            .await;

        if !filing.success {
            return Err(EngineError::ToolExecution {
                tool: "filing_excerpt".to_string(),
                message: filing
                    .error
                    .unwrap_or_else(|| "source document unavailable".to_string()),
            });
        }

        let document = filing
            .data
            .get("excerpt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| filing.data.to_string());
        let document_type = filing
            .data
            .get("document_type")
            .and_then(Value::as_str)
            .unwrap_or("document")
            .to_string();

        let (admitted, strategy) = ctx
            .budget
            .admit(
                self.provider.as_ref(),
                stage,
                "source document",
                &document,
                SUMMARY_CAP_TOKENS,
            )
            .await?;

        let prompt = build_period_prompt(&request.subject, year, &document_type, &admitted);
        let specs = self.registry.specs();
        let outcome = self
            .provider
            .run_agentic_loop(
                AgenticRequest {
                    system_prompt: PERIOD_SYSTEM,
                    initial_message: &prompt,
                    tools: &specs,
                    cancelled: request.cancelled.clone(),
                },
                &executor,
            )
            .await?;
        ctx.budget.charge(estimate_tokens(&outcome.text));

        let extraction = self.extract_tolerant(&outcome.text, stage)?;
        let mut metrics = extraction.metrics;
        apply_cached_overrides(&mut metrics, &ctx.cache, Some(year)).await;

        debug!(
            stage,
            populated = metrics.populated_count(),
            tool_calls = outcome.trace.len(),
            strategy = %strategy,
            "Period stage complete"
        );

        let period = PeriodAnalysis {
            period_id: period_label(year),
            token_estimate: estimate_tokens(&extraction.narrative),
            narrative: extraction.narrative,
            metrics,
            insights: extraction.insights,
            tool_calls_made: outcome.trace.len() as u32,
            strategy,
        };
        Ok((period, outcome.usage))
    }

    /// Synthesize across the per-period analyses. The prompt carries a
    /// trend table computed purely from the stored numbers, so the model
    /// reasons over figures the engine can later re-verify.
    async fn run_synthesis_stage(
        &self,
        ctx: &RunContext,
        request: &AnalysisRequest,
        result: &mut AnalysisResult,
    ) -> Result<TokenUsage> {
        self.check_cancelled(request, "synthesis")?;

        let trend_table = build_trend_table(&result.periods);
        let digest = build_period_digest(&result.periods, &result.period_gaps);
        let (admitted, _) = ctx
            .budget
            .admit(
                self.provider.as_ref(),
                "synthesis",
                "period history",
                &digest,
                SUMMARY_CAP_TOKENS * 2,
            )
            .await?;

        let prompt = build_synthesis_prompt(&request.subject, &trend_table, &admitted);
        let executor = CachingExecutor::new(&ctx.cache, &self.registry);
        let specs = self.registry.specs();
        let outcome = self
            .provider
            .run_agentic_loop(
                AgenticRequest {
                    system_prompt: SYNTHESIS_SYSTEM,
                    initial_message: &prompt,
                    tools: &specs,
                    cancelled: request.cancelled.clone(),
                },
                &executor,
            )
            .await?;
        ctx.budget.charge(estimate_tokens(&outcome.text));

        let extraction = self.extract_tolerant(&outcome.text, "synthesis")?;
        let mut metrics = extraction.metrics;
        apply_cached_overrides(&mut metrics, &ctx.cache, Some(request.current_fiscal_year)).await;

        result.decision = extraction.insights.decision;
        result.conviction = extraction.insights.conviction;
        result.narrative = extraction.narrative;
        result.numeric_highlights = metrics;
        Ok(outcome.usage)
    }

    /// Strict extraction, downgrading a schema violation to a lenient
    /// re-pass that omits the offending field.
    fn extract_tolerant(&self, raw: &str, stage: &str) -> Result<Extraction> {
        match self.extractor.extract(raw) {
            Ok(extraction) => Ok(extraction),
            Err(EngineError::SchemaValidation { field, message }) => {
                warn!(stage, field = %field, %message, "Dropping out-of-range structured field");
                Ok(self.extractor.extract_lenient(raw))
            }
            Err(e) => Err(e),
        }
    }

    fn check_cancelled(&self, request: &AnalysisRequest, stage: &str) -> Result<()> {
        if let Some(flag) = &request.cancelled {
            if flag.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled(stage.to_string()));
            }
        }
        Ok(())
    }

    /// Convert a fatal stage error into a structured failed result that
    /// keeps everything completed so far.
    async fn fail(
        &self,
        mut result: AnalysisResult,
        stage: &str,
        cause: EngineError,
        ctx: &RunContext,
    ) -> AnalysisResult {
        error!(stage, error = %cause, "Analysis run failed");
        result.cache_stats = Some(ctx.cache.stats().await);
        result.outcome = RunOutcome::Failed {
            stage: stage.to_string(),
            cause: cause.to_string(),
        };
        self.report("failed", 1.0, format!("Run failed during {}", stage));
        result
    }

    fn report(&self, stage: &str, fraction: f32, message: impl Into<String>) {
        let progress = StageProgress {
            stage: stage.to_string(),
            fraction,
            message: message.into(),
        };
        debug!(stage = %progress.stage, fraction, "Stage progress");
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

fn period_label(year: i64) -> String {
    format!("FY{}", year)
}

//
// ================= Prompts =================
//

const PERIOD_SYSTEM: &str = "You are a fundamental investment analyst examining one fiscal \
period. Use the available tools for any figure you do not see in the source document; never \
compute ratios yourself. End your reply with a fenced block opened by ```analysis-data \
containing a JSON object: {\"metrics\": {...}, \"insights\": {...}}. Metric values are \
fractions (0.42, not 42%). Insights may include moat (none|narrow|wide), risk \
(low|medium|high), strengths, and concerns.";

const SYNTHESIS_SYSTEM: &str = "You are a fundamental investment analyst forming a final \
view from several years of per-period analysis. Cite the exact values from the trend table \
when you discuss trajectories; do not restate figures from memory. End your reply with a \
fenced block opened by ```analysis-data containing a JSON object: {\"metrics\": {...}, \
\"insights\": {\"decision\": \"BUY|WATCH|AVOID\", \"conviction\": \"low|moderate|high\", \
...}}. A decision and conviction are mandatory.";

fn build_period_prompt(subject: &str, year: i64, document_type: &str, document: &str) -> String {
    format!(
        r#"Analyze {} for fiscal year {}.

SOURCE ({}):
---
{}
---

Cover revenue trajectory, margin structure, returns on capital, and balance-sheet posture
for this period only."#,
        subject, year, document_type, document
    )
}

fn build_synthesis_prompt(subject: &str, trend_table: &str, digest: &str) -> String {
    format!(
        r#"Form a final investment view on {}.

TREND TABLE (computed from the per-period numbers):
{}

PER-PERIOD NOTES:
{}

Weigh the multi-year trajectory, decide BUY, WATCH, or AVOID, and state your conviction."#,
        subject, trend_table, digest
    )
}

/// Markdown trend table over the stored per-period numbers, oldest
/// period first. Cells without a value render as "-".
fn build_trend_table(periods: &[PeriodAnalysis]) -> String {
    let mut ordered: Vec<&PeriodAnalysis> = periods.iter().collect();
    ordered.sort_by(|a, b| a.period_id.cmp(&b.period_id));

    let cell = |v: Option<f64>| match v {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => "-".to_string(),
    };

    let mut table = String::from(
        "| period | revenue growth | gross margin | operating margin | net margin | return on capital |\n\
         |--------|----------------|--------------|------------------|------------|--------------------|\n",
    );
    for p in ordered {
        table.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            p.period_id,
            cell(p.metrics.revenue_growth),
            cell(p.metrics.gross_margin),
            cell(p.metrics.operating_margin),
            cell(p.metrics.net_margin),
            cell(p.metrics.return_on_capital),
        ));
    }
    table
}

fn build_period_digest(periods: &[PeriodAnalysis], gaps: &[PeriodGap]) -> String {
    let mut ordered: Vec<&PeriodAnalysis> = periods.iter().collect();
    ordered.sort_by(|a, b| a.period_id.cmp(&b.period_id));

    let mut digest = String::new();
    for p in ordered {
        digest.push_str(&format!(
            "### {} ({} admission, {} tool calls)\n{}\n\n",
            p.period_id, p.strategy, p.tool_calls_made, p.narrative
        ));
    }
    for gap in gaps {
        digest.push_str(&format!("### {} unavailable: {}\n\n", gap.period_id, gap.reason));
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextStrategy, Decision, MetricField, Metrics, RunOutcome, Severity};
    use crate::provider::{ScriptedProvider, ScriptedReply};
    use crate::tools::{
        create_stub_registry, CalculatorTool, FilingExcerptTool, MarketSnapshotTool, WebSearchTool,
    };
    use std::sync::Mutex;

    fn fenced_reply(narrative: &str, metrics: Value, insights: Value) -> String {
        format!(
            "{}\n```analysis-data\n{}\n```",
            narrative,
            json!({ "metrics": metrics, "insights": insights })
        )
    }

    fn period_reply(year: i64) -> ScriptedReply {
        ScriptedReply::text_only(fenced_reply(
            &format!("FY{} showed steady execution with stable pricing.", year),
            json!({ "gross_margin": 0.55, "operating_margin": 0.31, "net_margin": 0.22 }),
            json!({ "moat": "narrow", "risk": "low" }),
        ))
    }

    fn synthesis_reply() -> ScriptedReply {
        ScriptedReply::text_only(fenced_reply(
            "Returns have stayed consistent across the window; initiating a position.",
            json!({ "gross_margin": 0.55, "operating_margin": 0.31, "net_margin": 0.22 }),
            json!({ "decision": "BUY", "conviction": "moderate", "moat": "narrow", "risk": "low" }),
        ))
    }

    fn clean_critic() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(vec![ScriptedReply::text_only(
            r#"{"score": 90, "findings": []}"#,
        )]))
    }

    fn registry_missing(years: Vec<i64>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MarketSnapshotTool));
        registry.register(Arc::new(FilingExcerptTool::new().with_missing_years(years)));
        registry.register(Arc::new(CalculatorTool));
        registry.register(Arc::new(WebSearchTool));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_single_period_run_reaches_a_decision_on_a_cold_cache() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            period_reply(2024),
            synthesis_reply(),
        ]));
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_cb = seen.clone();
        let orchestrator = StageOrchestrator::new(
            provider,
            clean_critic(),
            Arc::new(create_stub_registry()),
        )
        .with_progress(Arc::new(move |p: StageProgress| {
            seen_by_cb.lock().unwrap().push(p.stage);
        }));

        let result = orchestrator
            .analyze(AnalysisRequest::new("ACME", 2024).with_prior_periods(0))
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Accepted);
        assert_eq!(result.decision, Some(Decision::Buy));
        assert_eq!(result.periods.len(), 1);
        assert!(result.period_gaps.is_empty());

        // Nothing repeats in a single-period run, so the cache never hits.
        let stats = result.cache_stats.unwrap();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.hit_rate, 0.0);

        let error_findings = result
            .validation_history
            .iter()
            .flat_map(|p| &p.findings)
            .filter(|f| f.severity == Severity::Error)
            .count();
        assert_eq!(error_findings, 0);

        let stages = seen.lock().unwrap();
        assert_eq!(stages.first().map(String::as_str), Some("current_period"));
        assert_eq!(stages.last().map(String::as_str), Some("done"));
        assert!(stages.iter().any(|s| s == "synthesis"));
    }

    #[tokio::test]
    async fn test_missing_prior_document_becomes_a_gap_not_a_failure() {
        // Five periods requested, FY2022's document does not exist. The
        // FY2023 stage re-requests a warmed market snapshot.
        let provider = Arc::new(ScriptedProvider::new(vec![
            period_reply(2024),
            ScriptedReply::with_tools(
                vec![ToolInput {
                    tool_name: "market_snapshot".to_string(),
                    parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
                }],
                fenced_reply(
                    "FY2023 held margins steady on flat volumes.",
                    json!({}),
                    json!({ "risk": "low" }),
                ),
            ),
            period_reply(2021),
            period_reply(2020),
            synthesis_reply(),
        ]));
        let orchestrator =
            StageOrchestrator::new(provider, clean_critic(), registry_missing(vec![2022]));

        let result = orchestrator
            .analyze(AnalysisRequest::new("ACME", 2024).with_prior_periods(4))
            .await
            .unwrap();

        assert_eq!(result.periods.len(), 4);
        assert_eq!(result.period_gaps.len(), 1);
        assert_eq!(result.period_gaps[0].period_id, "FY2022");
        assert!(result.period_gaps[0].reason.contains("no filing available"));
        assert_eq!(result.decision, Some(Decision::Buy));
        assert_eq!(result.outcome, RunOutcome::Accepted);

        // The warmed snapshot absorbed the FY2023 lookup.
        let stats = result.cache_stats.unwrap();
        assert!(stats.hits >= 1);

        // Tool-computed values for FY2023 overlaid the narrative ones.
        let fy2023 = result
            .periods
            .iter()
            .find(|p| p.period_id == "FY2023")
            .unwrap();
        assert!(fy2023.metrics.operating_margin.is_some());
    }

    #[tokio::test]
    async fn test_identical_scripts_yield_identical_structured_output() {
        let build = || {
            let provider = Arc::new(ScriptedProvider::new(vec![
                period_reply(2024),
                period_reply(2023),
                synthesis_reply(),
            ]));
            StageOrchestrator::new(provider, clean_critic(), Arc::new(create_stub_registry()))
        };

        let a = build()
            .analyze(AnalysisRequest::new("ACME", 2024).with_prior_periods(1))
            .await
            .unwrap();
        let b = build()
            .analyze(AnalysisRequest::new("ACME", 2024).with_prior_periods(1))
            .await
            .unwrap();

        assert_eq!(a.decision, b.decision);
        assert_eq!(a.conviction, b.conviction);
        assert_eq!(a.numeric_highlights, b.numeric_highlights);
        assert_eq!(a.periods.len(), b.periods.len());
        for (pa, pb) in a.periods.iter().zip(&b.periods) {
            assert_eq!(pa.metrics, pb.metrics);
            assert_eq!(pa.insights, pb.insights);
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_with_stage_and_partial_state() {
        // Window barely above the output reserve: the source document
        // cannot fit, and the scripted "summary" is far too long.
        let provider = Arc::new(ScriptedProvider::with_window(
            vec![ScriptedReply::text_only("y".repeat(4_000))],
            crate::budget::DEFAULT_RESERVED_OUTPUT_TOKENS + 8,
        ));
        let orchestrator = StageOrchestrator::new(
            provider,
            clean_critic(),
            Arc::new(create_stub_registry()),
        );

        let result = orchestrator
            .analyze(AnalysisRequest::new("ACME", 2024).with_prior_periods(0))
            .await
            .unwrap();

        match &result.outcome {
            RunOutcome::Failed { stage, cause } => {
                assert_eq!(stage, "current_period");
                assert!(cause.contains("budget"), "cause was: {}", cause);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(result.cache_stats.is_some());
        assert!(result.periods.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_produces_a_failed_outcome() {
        let flag = Arc::new(AtomicBool::new(true));
        let orchestrator = StageOrchestrator::new(
            Arc::new(ScriptedProvider::new(vec![])),
            clean_critic(),
            Arc::new(create_stub_registry()),
        );

        let result = orchestrator
            .analyze(
                AnalysisRequest::new("ACME", 2024)
                    .with_prior_periods(0)
                    .with_cancellation(flag),
            )
            .await
            .unwrap();

        match &result.outcome {
            RunOutcome::Failed { stage, cause } => {
                assert_eq!(stage, "current_period");
                assert!(cause.contains("cancelled"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_trend_table_orders_periods_and_marks_absent_cells() {
        let mut newer = Metrics::default();
        newer.set(MetricField::OperatingMargin, 0.31).unwrap();
        let older = Metrics::default();

        let periods = vec![
            PeriodAnalysis {
                period_id: "FY2024".to_string(),
                narrative: String::new(),
                metrics: newer,
                insights: Default::default(),
                tool_calls_made: 0,
                token_estimate: 0,
                strategy: ContextStrategy::Standard,
            },
            PeriodAnalysis {
                period_id: "FY2022".to_string(),
                narrative: String::new(),
                metrics: older,
                insights: Default::default(),
                tool_calls_made: 0,
                token_estimate: 0,
                strategy: ContextStrategy::Standard,
            },
        ];

        let table = build_trend_table(&periods);
        let fy2022 = table.find("FY2022").unwrap();
        let fy2024 = table.find("FY2024").unwrap();
        assert!(fy2022 < fy2024);
        assert!(table.contains("31.0%"));
        assert!(table.lines().nth(2).unwrap().contains("| - |"));
    }
}
