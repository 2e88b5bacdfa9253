//! Tool trait and registry
//!
//! Domain tools are external collaborators; the engine owns only the
//! execution contract and schema advertising. The stub tools here are
//! deterministic stand-ins used by tests and the demo binary.

use crate::error::EngineError;
use crate::models::{ToolInput, ToolOutput};
use crate::provider::ToolSpec;
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for a single domain tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// JSON-schema object for the tool's parameters, declared once and
    /// advertised to the model by the provider adapter.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and advertising tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Tool catalog handed to the provider adapter.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn require_str(input: &ToolInput, key: &str) -> Result<String> {
    input
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| EngineError::ToolExecution {
            tool: input.tool_name.clone(),
            message: format!("expected string parameter '{}'", key),
        })
}

fn require_i64(input: &ToolInput, key: &str) -> Result<i64> {
    input
        .parameters
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::ToolExecution {
            tool: input.tool_name.clone(),
            message: format!("expected integer parameter '{}'", key),
        })
}

//
// ================= Stub: market snapshot =================
//

/// Deterministic fundamentals lookup keyed on (symbol, fiscal_year).
pub struct MarketSnapshotTool;

#[async_trait::async_trait]
impl Tool for MarketSnapshotTool {
    fn name(&self) -> &'static str {
        "market_snapshot"
    }

    fn description(&self) -> &'static str {
        "Fetch fundamental financial data for a symbol and fiscal year"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string" },
                "fiscal_year": { "type": "integer" }
            },
            "required": ["symbol", "fiscal_year"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let symbol = require_str(input, "symbol")?;
        let year = require_i64(input, "fiscal_year")?;

        // Seeded by symbol length + year so repeated calls are identical.
        let seed = (symbol.len() as i64 + year) % 7;
        let base_margin = 0.30 + 0.01 * seed as f64;

        Ok(ToolOutput::ok(json!({
            "symbol": symbol,
            "fiscal_year": year,
            "revenue": 1_000.0 + 50.0 * seed as f64,
            "gross_margin": base_margin + 0.25,
            "operating_margin": base_margin,
            "net_margin": base_margin - 0.08,
            "return_on_capital": 0.14 + 0.005 * seed as f64,
            "debt_to_equity": 0.6,
            "current_price": 85.0 + seed as f64,
        })))
    }
}

//
// ================= Stub: filing retrieval =================
//

/// Primary document type served by the filing stub.
pub const PRIMARY_DOCUMENT_TYPE: &str = "annual_report";
/// Transparent fallback when the primary type is unavailable.
pub const FALLBACK_DOCUMENT_TYPE: &str = "earnings_release";

/// Deterministic filing retrieval with a transparent fallback document
/// type. Reports which type it actually supplied for accurate citation.
pub struct FilingExcerptTool {
    /// Years where only the fallback document type exists.
    fallback_years: Vec<i64>,
    /// Years where no document exists at all.
    missing_years: Vec<i64>,
}

impl FilingExcerptTool {
    pub fn new() -> Self {
        Self {
            fallback_years: Vec::new(),
            missing_years: Vec::new(),
        }
    }

    pub fn with_fallback_years(mut self, years: Vec<i64>) -> Self {
        self.fallback_years = years;
        self
    }

    pub fn with_missing_years(mut self, years: Vec<i64>) -> Self {
        self.missing_years = years;
        self
    }
}

impl Default for FilingExcerptTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for FilingExcerptTool {
    fn name(&self) -> &'static str {
        "filing_excerpt"
    }

    fn description(&self) -> &'static str {
        "Retrieve a filing excerpt for a symbol and fiscal year"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string" },
                "fiscal_year": { "type": "integer" },
                "document_type": { "type": "string" }
            },
            "required": ["symbol", "fiscal_year"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let symbol = require_str(input, "symbol")?;
        let year = require_i64(input, "fiscal_year")?;

        if self.missing_years.contains(&year) {
            return Ok(ToolOutput::failed(format!(
                "no filing available for {} FY{}",
                symbol, year
            )));
        }

        let supplied = if self.fallback_years.contains(&year) {
            FALLBACK_DOCUMENT_TYPE
        } else {
            PRIMARY_DOCUMENT_TYPE
        };

        Ok(ToolOutput::ok(json!({
            "symbol": symbol,
            "fiscal_year": year,
            "requested_type": PRIMARY_DOCUMENT_TYPE,
            "document_type": supplied,
            "excerpt": format!(
                "{} FY{}: revenue grew steadily; management cites durable demand.",
                symbol, year
            ),
        })))
    }
}

//
// ================= Stub: deterministic calculator =================
//

/// Deterministic financial calculator. The engine never computes
/// formulas itself; this stands in for the external calculator tool.
pub struct CalculatorTool;

#[async_trait::async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &'static str {
        "calculator"
    }

    fn description(&self) -> &'static str {
        "Run a deterministic financial computation (returns or valuation)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "computation": { "type": "string", "enum": ["returns", "valuation"] },
                "inputs": { "type": "object" }
            },
            "required": ["computation", "inputs"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let computation = require_str(input, "computation")?;
        let inputs = input
            .parameters
            .get("inputs")
            .and_then(|v| v.as_object())
            .ok_or_else(|| EngineError::ToolExecution {
                tool: input.tool_name.clone(),
                message: "expected object parameter 'inputs'".to_string(),
            })?;

        let num = |key: &str| -> Result<f64> {
            inputs
                .get(key)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| EngineError::ToolExecution {
                    tool: input.tool_name.clone(),
                    message: format!("computation '{}' needs numeric input '{}'", computation, key),
                })
        };

        match computation.as_str() {
            "returns" => {
                let nopat = num("nopat")?;
                let invested = num("invested_capital")?;
                if invested == 0.0 {
                    return Ok(ToolOutput::failed("invested_capital must be non-zero"));
                }
                Ok(ToolOutput::ok(json!({
                    "computation": "returns",
                    "return_on_capital": nopat / invested,
                })))
            }
            "valuation" => {
                let eps = num("eps")?;
                let growth = num("growth_rate")?;
                // Graham-style multiple; bounded growth factor.
                let factor = 8.5 + 2.0 * (growth * 100.0).clamp(0.0, 15.0);
                Ok(ToolOutput::ok(json!({
                    "computation": "valuation",
                    "intrinsic_value": eps * factor,
                })))
            }
            other => Ok(ToolOutput::failed(format!(
                "unknown computation '{}'",
                other
            ))),
        }
    }
}

//
// ================= Stub: web search =================
//

pub struct WebSearchTool;

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search for recent qualitative information about a subject"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_str(input, "query")?;
        Ok(ToolOutput::ok(json!({
            "query": query,
            "results": [
                { "title": "Industry overview", "snippet": "Sector demand remains stable." }
            ],
        })))
    }
}

/// Create a registry with the deterministic stub tools.
pub fn create_stub_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(MarketSnapshotTool));
    registry.register(Arc::new(FilingExcerptTool::new()));
    registry.register(Arc::new(CalculatorTool));
    registry.register(Arc::new(WebSearchTool));
    registry
}
