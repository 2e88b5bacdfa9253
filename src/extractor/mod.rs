//! Structured extraction from free-form stage output
//!
//! Two paths, in order: a schema-anchored fenced block requested from
//! the model, parsed and validated field-by-field and stripped from the
//! user-visible narrative; and a pattern-based fallback tier applying
//! multiple alternative text patterns per field, returning a partial
//! record rather than failing. Missing fields never raise; only schema
//! invariant violations do.

use crate::cache::{ToolCache, ToolFamily};
use crate::models::{Conviction, Decision, Insights, MetricField, Metrics, MoatStrength, RiskRating};
use crate::Result;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Fence the stage prompts ask the model to emit its data block in.
pub const DATA_FENCE: &str = "```analysis-data";

/// Result of one extraction pass.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub metrics: Metrics,
    pub insights: Insights,
    /// Narrative with the data block stripped out.
    pub narrative: String,
    pub used_fallback: bool,
}

enum Scale {
    Raw,
    Percent,
}

struct NumericPattern {
    field: MetricField,
    regex: Regex,
    scale: Scale,
}

/// Parses stage output into schema-validated Metrics and Insights.
pub struct StructuredExtractor {
    numeric_patterns: Vec<NumericPattern>,
    decision_patterns: Vec<Regex>,
    conviction_pattern: Regex,
    moat_pattern: Regex,
    risk_pattern: Regex,
}

impl StructuredExtractor {
    pub fn new() -> Self {
        let num = |field, pattern: &str, scale| NumericPattern {
            field,
            regex: Regex::new(pattern).expect("static extraction pattern"),
            scale,
        };

        // Multiple alternative patterns per field; percent-suffixed forms
        // are listed before raw-fraction forms so "42%" wins over "0.42".
        let numeric_patterns = vec![
            num(
                MetricField::GrossMargin,
                r"(?i)gross\s+margins?\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::GrossMargin,
                r"(?i)gross\s+margins?\D{0,24}?(-?0?\.\d+)",
                Scale::Raw,
            ),
            num(
                MetricField::OperatingMargin,
                r"(?i)operating\s+margins?\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::OperatingMargin,
                r"(?i)operating\s+margins?\D{0,24}?(-?0?\.\d+)",
                Scale::Raw,
            ),
            num(
                MetricField::NetMargin,
                r"(?i)net\s+(?:profit\s+)?margins?\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::NetMargin,
                r"(?i)net\s+(?:profit\s+)?margins?\D{0,24}?(-?0?\.\d+)",
                Scale::Raw,
            ),
            num(
                MetricField::ReturnOnCapital,
                r"(?i)(?:return\s+on\s+(?:invested\s+)?capital|\broic\b)\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::ReturnOnCapital,
                r"(?i)(?:return\s+on\s+(?:invested\s+)?capital|\broic\b)\D{0,24}?(0?\.\d+)",
                Scale::Raw,
            ),
            num(
                MetricField::ReturnOnEquity,
                r"(?i)(?:return\s+on\s+equity|\broe\b)\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::RevenueGrowth,
                r"(?i)(?:revenue|sales)\s+(?:growth|grew(?:\s+by)?)\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
            num(
                MetricField::DebtToEquity,
                r"(?i)debt[\s-]to[\s-]equity\D{0,24}?(\d+(?:\.\d+)?)",
                Scale::Raw,
            ),
            num(
                MetricField::CurrentRatio,
                r"(?i)current\s+ratio\D{0,24}?(\d+(?:\.\d+)?)",
                Scale::Raw,
            ),
            num(
                MetricField::PriceToEarnings,
                r"(?i)(?:price[\s-]to[\s-]earnings|p/e)\s*(?:ratio|multiple)?\D{0,16}?(\d+(?:\.\d+)?)",
                Scale::Raw,
            ),
            num(
                MetricField::IntrinsicValue,
                r"(?i)intrinsic\s+value\D{0,24}?\$?\s*(\d+(?:\.\d+)?)",
                Scale::Raw,
            ),
            num(
                MetricField::CurrentPrice,
                r"(?i)(?:current\s+price|trading\s+at)\D{0,24}?\$?\s*(\d+(?:\.\d+)?)",
                Scale::Raw,
            ),
            num(
                MetricField::MarginOfSafety,
                r"(?i)margin\s+of\s+safety\D{0,24}?(-?\d+(?:\.\d+)?)\s*%",
                Scale::Percent,
            ),
        ];

        let decision_patterns = vec![
            Regex::new(r"(?i)\bdecision\s*[:\-]\s*\**\s*(BUY|WATCH|AVOID)\b").unwrap(),
            Regex::new(r"(?i)\brecommendation\s*[:\-]\s*\**\s*(BUY|WATCH|AVOID)\b").unwrap(),
            Regex::new(r"(?i)\bverdict\s*[:\-]\s*\**\s*(BUY|WATCH|AVOID)\b").unwrap(),
        ];

        Self {
            numeric_patterns,
            decision_patterns,
            conviction_pattern: Regex::new(
                r"(?i)\bconviction\s*[:\-]\s*\**\s*(low|moderate|medium|high)\b",
            )
            .unwrap(),
            moat_pattern: Regex::new(
                r"(?i)\bmoat(?:\s+strength)?\s*[:\-]\s*\**\s*(none|narrow|wide)\b",
            )
            .unwrap(),
            risk_pattern: Regex::new(
                r"(?i)\brisk(?:\s+(?:level|rating))?\s*[:\-]\s*\**\s*(low|medium|moderate|high)\b",
            )
            .unwrap(),
        }
    }

    /// Extract from raw stage output. Raises only on a schema-invariant
    /// violation inside a well-formed structured block; an absent or
    /// unparseable block falls through to the pattern tier.
    pub fn extract(&self, raw: &str) -> Result<Extraction> {
        if let Some((block, narrative)) = split_fenced_block(raw) {
            match serde_json::from_str::<Value>(&block) {
                Ok(value) => return self.from_structured(&value, narrative, false),
                Err(e) => {
                    warn!("Unparseable data block, using pattern fallback: {}", e);
                }
            }
        }
        Ok(self.extract_with_patterns(raw))
    }

    /// Like [`extract`](Self::extract), but a field whose value violates
    /// its range is omitted instead of failing the pass. Used when the
    /// caller has already seen (and logged) the strict error.
    pub fn extract_lenient(&self, raw: &str) -> Extraction {
        if let Some((block, narrative)) = split_fenced_block(raw) {
            if let Ok(value) = serde_json::from_str::<Value>(&block) {
                if let Ok(extraction) = self.from_structured(&value, narrative, true) {
                    return extraction;
                }
            }
        }
        self.extract_with_patterns(raw)
    }

    fn from_structured(
        &self,
        value: &Value,
        narrative: String,
        omit_invalid: bool,
    ) -> Result<Extraction> {
        let mut metrics = Metrics::default();
        let mut insights = Insights::default();

        if let Some(fields) = value.get("metrics").and_then(Value::as_object) {
            for (name, raw) in fields {
                let Some(field) = MetricField::from_name(name) else {
                    debug!(field = %name, "Ignoring unknown metric field");
                    continue;
                };
                let Some(number) = raw.as_f64() else {
                    continue;
                };
                if let Err(e) = metrics.set(field, number) {
                    if omit_invalid {
                        warn!(field = %name, "Omitting out-of-range structured value");
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        if let Some(fields) = value.get("insights") {
            let text = |key: &str| fields.get(key).and_then(Value::as_str);
            insights.decision = text("decision").and_then(Decision::parse);
            insights.conviction = text("conviction").and_then(Conviction::parse);
            insights.moat = text("moat").and_then(MoatStrength::parse);
            insights.risk = text("risk").and_then(RiskRating::parse);

            for key in ["strengths", "concerns"] {
                if let Some(items) = fields.get(key).and_then(Value::as_array) {
                    for item in items.iter().filter_map(Value::as_str) {
                        if key == "strengths" {
                            insights.add_strength(item);
                        } else {
                            insights.add_concern(item);
                        }
                    }
                }
            }
        }

        Ok(Extraction {
            metrics,
            insights,
            narrative,
            used_fallback: false,
        })
    }

    /// Pattern tier: partial results, never raises.
    fn extract_with_patterns(&self, raw: &str) -> Extraction {
        let mut metrics = Metrics::default();
        let mut insights = Insights::default();

        for pattern in &self.numeric_patterns {
            if metrics.get(pattern.field).is_some() {
                continue; // earlier alternative already matched
            }
            if let Some(caps) = pattern.regex.captures(raw) {
                if let Ok(mut value) = caps[1].parse::<f64>() {
                    if matches!(pattern.scale, Scale::Percent) {
                        value /= 100.0;
                    }
                    // Out-of-range text matches are skipped, not raised.
                    if metrics.set(pattern.field, value).is_err() {
                        debug!(
                            field = pattern.field.name(),
                            value, "Skipping out-of-range pattern match"
                        );
                    }
                }
            }
        }

        for pattern in &self.decision_patterns {
            if insights.decision.is_some() {
                break;
            }
            if let Some(caps) = pattern.captures(raw) {
                insights.decision = Decision::parse(&caps[1]);
            }
        }
        if let Some(caps) = self.conviction_pattern.captures(raw) {
            insights.conviction = Conviction::parse(&caps[1]);
        }
        if let Some(caps) = self.moat_pattern.captures(raw) {
            insights.moat = MoatStrength::parse(&caps[1]);
        }
        if let Some(caps) = self.risk_pattern.captures(raw) {
            insights.risk = RiskRating::parse(&caps[1]);
        }

        Extraction {
            metrics,
            insights,
            narrative: raw.trim().to_string(),
            used_fallback: true,
        }
    }
}

impl Default for StructuredExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the fenced data block; returns (block body, narrative with the
/// block removed).
fn split_fenced_block(raw: &str) -> Option<(String, String)> {
    let start = raw.find(DATA_FENCE)?;
    let after = &raw[start + DATA_FENCE.len()..];
    let end = after.find("```")?;

    let block = after[..end].trim().to_string();
    let narrative = format!(
        "{}{}",
        raw[..start].trim_end(),
        &after[end + 3..]
    )
    .trim()
    .to_string();

    Some((block, narrative))
}

/// Overlay numeric values found in successful cached tool payloads.
/// Cached, tool-computed values take precedence over narrative-derived
/// ones; invalid cached values are skipped, never coerced.
///
/// Market-data records are year-scoped, so they apply only when the
/// caller names the fiscal year they are deriving; calculator records
/// apply everywhere. Records are replayed in creation order so repeated
/// runs overlay identically.
pub async fn apply_cached_overrides(
    metrics: &mut Metrics,
    cache: &ToolCache,
    fiscal_year: Option<i64>,
) {
    for family in [ToolFamily::MarketData, ToolFamily::Calculator] {
        if family == ToolFamily::MarketData && fiscal_year.is_none() {
            continue;
        }

        let mut records = cache.successful_in_family(family).await;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.canonical_key.cmp(&b.canonical_key))
        });

        for record in records {
            if family == ToolFamily::MarketData {
                let record_year = record.parameters.get("fiscal_year").and_then(Value::as_i64);
                if record_year != fiscal_year {
                    continue;
                }
            }
            let Some(fields) = record.payload.as_object() else {
                continue;
            };
            for (name, raw) in fields {
                let Some(field) = MetricField::from_name(name) else {
                    continue;
                };
                let Some(number) = raw.as_f64() else {
                    continue;
                };
                if metrics.set(field, number).is_err() {
                    warn!(
                        field = %name,
                        tool = %record.tool_name,
                        "Cached payload value outside declared range; ignored"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCallRecord;
    use crate::models::{ToolInput, ToolOutput};
    use serde_json::json;

    fn extractor() -> StructuredExtractor {
        StructuredExtractor::new()
    }

    const STRUCTURED: &str = r#"The business shows durable pricing power.

```analysis-data
{
  "metrics": { "gross_margin": 0.55, "operating_margin": 0.31, "return_on_capital": 0.18 },
  "insights": {
    "decision": "BUY",
    "conviction": "high",
    "moat": "wide",
    "risk": "low",
    "strengths": ["Pricing power across the product line"],
    "concerns": ["Customer concentration in two accounts"]
  }
}
```

Margins have widened for three consecutive years."#;

    #[test]
    fn test_structured_block_parsed_and_stripped() {
        let extraction = extractor().extract(STRUCTURED).unwrap();

        assert!(!extraction.used_fallback);
        assert_eq!(extraction.metrics.gross_margin, Some(0.55));
        assert_eq!(extraction.insights.decision, Some(Decision::Buy));
        assert_eq!(extraction.insights.moat, Some(MoatStrength::Wide));
        assert_eq!(extraction.insights.strengths.len(), 1);

        assert!(!extraction.narrative.contains("analysis-data"));
        assert!(extraction.narrative.contains("durable pricing power"));
        assert!(extraction.narrative.contains("three consecutive years"));
    }

    #[test]
    fn test_invalid_block_falls_back_to_patterns() {
        let raw = "```analysis-data\n{not json\n```\nOperating margin: 28%. Decision: WATCH.";
        let extraction = extractor().extract(raw).unwrap();

        assert!(extraction.used_fallback);
        assert_eq!(extraction.metrics.operating_margin, Some(0.28));
        assert_eq!(extraction.insights.decision, Some(Decision::Watch));
    }

    #[test]
    fn test_out_of_range_structured_value_raises_with_field() {
        let raw = "```analysis-data\n{ \"metrics\": { \"return_on_capital\": 9.0 } }\n```";
        let err = extractor().extract(raw).unwrap_err();
        match err {
            crate::error::EngineError::SchemaValidation { field, .. } => {
                assert_eq!(field, "return_on_capital");
            }
            other => panic!("unexpected error: {}", other),
        }

        // Lenient pass omits the field instead.
        let lenient = extractor().extract_lenient(raw);
        assert_eq!(lenient.metrics.return_on_capital, None);
    }

    #[test]
    fn test_pattern_tier_partial_never_raises() {
        let raw = "Gross margin of 61% with ROIC near 22%. Revenue grew 14% in FY2023. \
                   Margin of safety: 35%. Conviction: moderate. Risk level: medium.";
        let extraction = extractor().extract(raw).unwrap();

        assert!(extraction.used_fallback);
        assert_eq!(extraction.metrics.gross_margin, Some(0.61));
        assert_eq!(extraction.metrics.return_on_capital, Some(0.22));
        assert_eq!(extraction.metrics.revenue_growth, Some(0.14));
        assert_eq!(extraction.metrics.margin_of_safety, Some(0.35));
        assert_eq!(extraction.insights.conviction, Some(Conviction::Moderate));
        assert_eq!(extraction.insights.risk, Some(RiskRating::Medium));
        // Fields without any matching text stay absent.
        assert_eq!(extraction.metrics.price_to_book, None);
    }

    #[test]
    fn test_missing_fields_never_raise() {
        let extraction = extractor().extract("No numbers at all here.").unwrap();
        assert!(extraction.metrics.is_empty());
        assert!(extraction.insights.is_empty());
    }

    #[tokio::test]
    async fn test_cached_values_take_precedence() {
        let cache = crate::cache::ToolCache::new();
        let input = ToolInput {
            tool_name: "calculator".to_string(),
            parameters: json!({
                "computation": "returns",
                "inputs": { "nopat": 180.0, "invested_capital": 1000.0 }
            }),
        };
        cache
            .put(ToolCallRecord::from_output(
                &input,
                &ToolOutput::ok(json!({ "return_on_capital": 0.18 })),
            ))
            .await;

        let mut metrics = Metrics::default();
        metrics.set(MetricField::ReturnOnCapital, 0.11).unwrap();
        metrics.set(MetricField::GrossMargin, 0.5).unwrap();

        apply_cached_overrides(&mut metrics, &cache, None).await;

        // Tool-computed value replaces the narrative-derived one.
        assert_eq!(metrics.return_on_capital, Some(0.18));
        // Narrative value without a cached counterpart survives.
        assert_eq!(metrics.gross_margin, Some(0.5));
    }

    #[tokio::test]
    async fn test_market_overrides_are_year_scoped() {
        let cache = crate::cache::ToolCache::new();
        for (year, margin) in [(2022, 0.31), (2023, 0.36)] {
            let input = ToolInput {
                tool_name: "market_snapshot".to_string(),
                parameters: json!({ "symbol": "ACME", "fiscal_year": year }),
            };
            cache
                .put(ToolCallRecord::from_output(
                    &input,
                    &ToolOutput::ok(json!({ "operating_margin": margin })),
                ))
                .await;
        }

        let mut metrics = Metrics::default();
        apply_cached_overrides(&mut metrics, &cache, Some(2022)).await;
        assert_eq!(metrics.operating_margin, Some(0.31));

        // No year named: market-data records do not apply at all.
        let mut unscoped = Metrics::default();
        apply_cached_overrides(&mut unscoped, &cache, None).await;
        assert_eq!(unscoped.operating_margin, None);
    }
}
