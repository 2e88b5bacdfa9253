//! Core data models for the analysis engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Version of the externally visible AnalysisResult schema.
pub const SCHEMA_VERSION: u32 = 1;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    Watch,
    Avoid,
}

impl Decision {
    /// Case-insensitive parse used by the extractor's fallback tier.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Decision::Buy),
            "WATCH" => Some(Decision::Watch),
            "AVOID" => Some(Decision::Avoid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Conviction {
    Low,
    Moderate,
    High,
}

impl Conviction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Conviction::Low),
            "moderate" | "medium" => Some(Conviction::Moderate),
            "high" => Some(Conviction::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MoatStrength {
    None,
    Narrow,
    Wide,
}

impl MoatStrength {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(MoatStrength::None),
            "narrow" => Some(MoatStrength::Narrow),
            "wide" => Some(MoatStrength::Wide),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskRating {
    Low,
    Medium,
    High,
}

impl RiskRating {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskRating::Low),
            "medium" | "moderate" => Some(RiskRating::Medium),
            "high" => Some(RiskRating::High),
            _ => None,
        }
    }
}

/// Strategy the budget manager chose for admitting a stage input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    Standard,
    AdaptiveSummary,
}

//
// ================= Metric bounds (policy constants) =================
//
// The ranges are policy values inherited from the original analysis
// rules; the enforcement mechanism (fail at assignment) is fixed.

pub mod bounds {
    /// Margins expressed as fractions of revenue.
    pub const MARGIN_RANGE: (f64, f64) = (-1.0, 1.0);
    /// Year-over-year growth rates.
    pub const GROWTH_RANGE: (f64, f64) = (-1.0, 10.0);
    /// Returns-on-capital style ratios.
    pub const RETURN_RATIO_RANGE: (f64, f64) = (0.0, 5.0);
    /// Debt-to-equity and similar leverage ratios.
    pub const LEVERAGE_RANGE: (f64, f64) = (0.0, 50.0);
    /// Current ratio and similar liquidity ratios.
    pub const LIQUIDITY_RANGE: (f64, f64) = (0.0, 20.0);
    /// Valuation multiples (P/E, P/B).
    pub const MULTIPLE_RANGE: (f64, f64) = (0.0, 1000.0);
    /// Prices and intrinsic values are strictly positive, bounded above
    /// only to catch obviously corrupt extractions.
    pub const PRICE_RANGE: (f64, f64) = (0.0, 10_000_000.0);
    /// Margin-of-safety as a fraction of intrinsic value.
    pub const SAFETY_MARGIN_RANGE: (f64, f64) = (-5.0, 1.0);
    /// Absolute tolerance for cross-field margin ordering checks.
    pub const MARGIN_ORDER_TOLERANCE: f64 = 0.005;
}

//
// ================= Metrics =================
//

/// Identifies a single numeric field of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    RevenueGrowth,
    GrossMargin,
    OperatingMargin,
    NetMargin,
    ReturnOnCapital,
    ReturnOnEquity,
    DebtToEquity,
    CurrentRatio,
    PriceToEarnings,
    PriceToBook,
    CurrentPrice,
    IntrinsicValue,
    MarginOfSafety,
}

impl MetricField {
    pub const ALL: &'static [MetricField] = &[
        MetricField::RevenueGrowth,
        MetricField::GrossMargin,
        MetricField::OperatingMargin,
        MetricField::NetMargin,
        MetricField::ReturnOnCapital,
        MetricField::ReturnOnEquity,
        MetricField::DebtToEquity,
        MetricField::CurrentRatio,
        MetricField::PriceToEarnings,
        MetricField::PriceToBook,
        MetricField::CurrentPrice,
        MetricField::IntrinsicValue,
        MetricField::MarginOfSafety,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetricField::RevenueGrowth => "revenue_growth",
            MetricField::GrossMargin => "gross_margin",
            MetricField::OperatingMargin => "operating_margin",
            MetricField::NetMargin => "net_margin",
            MetricField::ReturnOnCapital => "return_on_capital",
            MetricField::ReturnOnEquity => "return_on_equity",
            MetricField::DebtToEquity => "debt_to_equity",
            MetricField::CurrentRatio => "current_ratio",
            MetricField::PriceToEarnings => "price_to_earnings",
            MetricField::PriceToBook => "price_to_book",
            MetricField::CurrentPrice => "current_price",
            MetricField::IntrinsicValue => "intrinsic_value",
            MetricField::MarginOfSafety => "margin_of_safety",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        MetricField::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Declared valid range for the field.
    pub fn range(&self) -> (f64, f64) {
        match self {
            MetricField::RevenueGrowth => bounds::GROWTH_RANGE,
            MetricField::GrossMargin | MetricField::OperatingMargin | MetricField::NetMargin => {
                bounds::MARGIN_RANGE
            }
            MetricField::ReturnOnCapital | MetricField::ReturnOnEquity => {
                bounds::RETURN_RATIO_RANGE
            }
            MetricField::DebtToEquity => bounds::LEVERAGE_RANGE,
            MetricField::CurrentRatio => bounds::LIQUIDITY_RANGE,
            MetricField::PriceToEarnings | MetricField::PriceToBook => bounds::MULTIPLE_RANGE,
            MetricField::CurrentPrice | MetricField::IntrinsicValue => bounds::PRICE_RANGE,
            MetricField::MarginOfSafety => bounds::SAFETY_MARGIN_RANGE,
        }
    }

    /// Price-shaped fields exclude the lower bound (strictly positive).
    pub fn strictly_positive(&self) -> bool {
        matches!(self, MetricField::CurrentPrice | MetricField::IntrinsicValue)
    }
}

/// Flat record of optional numeric analysis fields.
///
/// Every assignment goes through [`Metrics::set`], which enforces the
/// declared range and fails with a field-identified error. Construction
/// via serde is only used for payloads that were validated on the way in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub revenue_growth: Option<f64>,
    pub gross_margin: Option<f64>,
    pub operating_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub return_on_capital: Option<f64>,
    pub return_on_equity: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub current_ratio: Option<f64>,
    pub price_to_earnings: Option<f64>,
    pub price_to_book: Option<f64>,
    pub current_price: Option<f64>,
    pub intrinsic_value: Option<f64>,
    pub margin_of_safety: Option<f64>,
}

impl Metrics {
    /// Assign a field, enforcing its declared range immediately.
    pub fn set(&mut self, field: MetricField, value: f64) -> crate::Result<()> {
        if !value.is_finite() {
            return Err(crate::error::EngineError::SchemaValidation {
                field: field.name().to_string(),
                message: format!("non-finite value {}", value),
            });
        }

        let (lo, hi) = field.range();
        let below = if field.strictly_positive() {
            value <= lo
        } else {
            value < lo
        };

        if below || value > hi {
            return Err(crate::error::EngineError::SchemaValidation {
                field: field.name().to_string(),
                message: format!("value {} outside declared range [{}, {}]", value, lo, hi),
            });
        }

        *self.slot_mut(field) = Some(value);
        Ok(())
    }

    pub fn get(&self, field: MetricField) -> Option<f64> {
        *self.slot(field)
    }

    fn slot(&self, field: MetricField) -> &Option<f64> {
        match field {
            MetricField::RevenueGrowth => &self.revenue_growth,
            MetricField::GrossMargin => &self.gross_margin,
            MetricField::OperatingMargin => &self.operating_margin,
            MetricField::NetMargin => &self.net_margin,
            MetricField::ReturnOnCapital => &self.return_on_capital,
            MetricField::ReturnOnEquity => &self.return_on_equity,
            MetricField::DebtToEquity => &self.debt_to_equity,
            MetricField::CurrentRatio => &self.current_ratio,
            MetricField::PriceToEarnings => &self.price_to_earnings,
            MetricField::PriceToBook => &self.price_to_book,
            MetricField::CurrentPrice => &self.current_price,
            MetricField::IntrinsicValue => &self.intrinsic_value,
            MetricField::MarginOfSafety => &self.margin_of_safety,
        }
    }

    fn slot_mut(&mut self, field: MetricField) -> &mut Option<f64> {
        match field {
            MetricField::RevenueGrowth => &mut self.revenue_growth,
            MetricField::GrossMargin => &mut self.gross_margin,
            MetricField::OperatingMargin => &mut self.operating_margin,
            MetricField::NetMargin => &mut self.net_margin,
            MetricField::ReturnOnCapital => &mut self.return_on_capital,
            MetricField::ReturnOnEquity => &mut self.return_on_equity,
            MetricField::DebtToEquity => &mut self.debt_to_equity,
            MetricField::CurrentRatio => &mut self.current_ratio,
            MetricField::PriceToEarnings => &mut self.price_to_earnings,
            MetricField::PriceToBook => &mut self.price_to_book,
            MetricField::CurrentPrice => &mut self.current_price,
            MetricField::IntrinsicValue => &mut self.intrinsic_value,
            MetricField::MarginOfSafety => &mut self.margin_of_safety,
        }
    }

    /// Overlay `other` on top of self, taking only fields `other` actually
    /// carries. Existing values are never replaced with null.
    pub fn merge_preferring(&mut self, other: &Metrics) {
        for field in MetricField::ALL {
            if let Some(v) = other.get(*field) {
                *self.slot_mut(*field) = Some(v);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        MetricField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    pub fn populated_count(&self) -> usize {
        MetricField::ALL.iter().filter(|f| self.get(**f).is_some()).count()
    }
}

//
// ================= Insights =================
//

/// Maximum entries per text-finding list.
pub const MAX_FINDING_ITEMS: usize = 5;
/// Minimum characters for a text finding to be kept.
pub const MIN_FINDING_LEN: usize = 12;

/// Flat record of enumerated qualitative conclusions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Insights {
    pub decision: Option<Decision>,
    pub conviction: Option<Conviction>,
    pub moat: Option<MoatStrength>,
    pub risk: Option<RiskRating>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

impl Insights {
    /// Add a strength finding. Entries below the minimum length or past
    /// the cap are dropped rather than stored malformed.
    pub fn add_strength(&mut self, item: impl Into<String>) -> bool {
        Self::push_bounded(&mut self.strengths, item.into())
    }

    pub fn add_concern(&mut self, item: impl Into<String>) -> bool {
        Self::push_bounded(&mut self.concerns, item.into())
    }

    fn push_bounded(list: &mut Vec<String>, item: String) -> bool {
        let item = item.trim().to_string();
        if item.len() < MIN_FINDING_LEN || list.len() >= MAX_FINDING_ITEMS {
            return false;
        }
        list.push(item);
        true
    }

    /// Overlay `other`, taking only fields it actually carries.
    pub fn merge_preferring(&mut self, other: &Insights) {
        if other.decision.is_some() {
            self.decision = other.decision;
        }
        if other.conviction.is_some() {
            self.conviction = other.conviction;
        }
        if other.moat.is_some() {
            self.moat = other.moat;
        }
        if other.risk.is_some() {
            self.risk = other.risk;
        }
        for s in &other.strengths {
            Self::push_bounded(&mut self.strengths, s.clone());
        }
        for c in &other.concerns {
            Self::push_bounded(&mut self.concerns, c.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.decision.is_none()
            && self.conviction.is_none()
            && self.moat.is_none()
            && self.risk.is_none()
            && self.strengths.is_empty()
            && self.concerns.is_empty()
    }
}

//
// ================= Period analysis =================
//

/// One analyzed fiscal period, completed by the extractor before the
/// orchestrator advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodAnalysis {
    pub period_id: String,
    pub narrative: String,
    pub metrics: Metrics,
    pub insights: Insights,
    pub tool_calls_made: u32,
    pub token_estimate: usize,
    pub strategy: ContextStrategy,
}

/// A prior period whose source document was unavailable; recorded
/// instead of failing the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodGap {
    pub period_id: String,
    pub reason: String,
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

//
// ================= Token accounting =================
//

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

//
// ================= Cache statistics =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub items_by_family: HashMap<String, usize>,
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn rank(&self) -> u8 {
        match self {
            Severity::Warning => 0,
            Severity::Error => 1,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Range,
    Consistency,
    Completeness,
    TrendClaim,
    Critic,
}

/// A single validation issue; ephemeral, recomputed each pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub category: FindingCategory,
    pub message: String,
    pub fixable: bool,
}

/// One completed validator pass, kept for the result's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPass {
    pub iteration: u32,
    pub findings: Vec<ValidationFinding>,
    pub score: Option<f64>,
    pub patch_applied: bool,
    pub created_at: DateTime<Utc>,
}

//
// ================= Final result =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Accepted,
    MaxIterationsReached { score: f64 },
    Unfixable,
    Failed { stage: String, cause: String },
}

/// Top-level output of one analysis run. Mutated only by the refinement
/// loop, and only by re-deriving fields from the merged narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub subject: String,
    pub decision: Option<Decision>,
    pub conviction: Option<Conviction>,
    pub narrative: String,
    pub numeric_highlights: Metrics,
    pub periods: Vec<PeriodAnalysis>,
    pub period_gaps: Vec<PeriodGap>,
    pub cache_stats: Option<CacheStats>,
    pub validation_history: Vec<ValidationPass>,
    pub outcome: RunOutcome,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            subject: subject.into(),
            decision: None,
            conviction: None,
            narrative: String::new(),
            numeric_highlights: Metrics::default(),
            periods: Vec::new(),
            period_gaps: Vec::new(),
            cache_stats: None,
            validation_history: Vec::new(),
            outcome: RunOutcome::Accepted,
            token_usage: TokenUsage::default(),
            created_at: Utc::now(),
        }
    }
}

//
// ================= Progress reporting =================
//

/// Emitted at stage boundaries for the front end to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub fraction: f32,
    pub message: String,
}

pub type ProgressCallback = Arc<dyn Fn(StageProgress) + Send + Sync>;

//
// ================= Display impls =================
//

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Buy => "BUY",
            Decision::Watch => "WATCH",
            Decision::Avoid => "AVOID",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Conviction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Conviction::Low => "low",
            Conviction::Moderate => "moderate",
            Conviction::High => "high",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextStrategy::Standard => "standard",
            ContextStrategy::AdaptiveSummary => "adaptive_summary",
        };
        write!(f, "{}", s)
    }
}
