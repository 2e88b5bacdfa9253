//! Per-run tool result cache
//!
//! Keyed store of prior tool results partitioned by tool family.
//! Entries are write-once-then-immutable within a run; failures are
//! cached too (tagged) so a caller can bypass-and-retry deliberately.

use crate::models::{CacheStats, ToolInput, ToolOutput};
use crate::tools::ToolRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

//
// ================= Tool families =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    MarketData,
    Filing,
    Search,
    Calculator,
    Other,
}

impl ToolFamily {
    pub fn from_tool_name(name: &str) -> Self {
        match name {
            "market_snapshot" => ToolFamily::MarketData,
            "filing_excerpt" => ToolFamily::Filing,
            "web_search" => ToolFamily::Search,
            "calculator" => ToolFamily::Calculator,
            _ => ToolFamily::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolFamily::MarketData => "market_data",
            ToolFamily::Filing => "filing",
            ToolFamily::Search => "search",
            ToolFamily::Calculator => "calculator",
            ToolFamily::Other => "other",
        }
    }
}

impl fmt::Display for ToolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Canonical keys =================
//

/// JSON rendered with recursively sorted object keys, so two maps with
/// different insertion orders canonicalize identically.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::String(s) => normalize_text(s),
        other => other.to_string(),
    }
}

/// Lowercase with collapsed whitespace; free-form input that means the
/// same computation must hash the same.
fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the canonical cache key for a tool call.
///
/// The key must include every output-affecting parameter and exclude
/// irrelevant ones. The calculator family depends on large free-form
/// input, so it keys on a content hash of the normalized computation
/// plus inputs, never on the nominal call type alone.
pub fn canonical_key(input: &ToolInput) -> (ToolFamily, String) {
    let family = ToolFamily::from_tool_name(&input.tool_name);
    let params = &input.parameters;

    let key = match family {
        ToolFamily::Calculator => {
            let computation = params
                .get("computation")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let inputs = params.get("inputs").cloned().unwrap_or(Value::Null);
            sha256_hex(&format!(
                "calculator\u{0}{}\u{0}{}",
                normalize_text(computation),
                canonical_json(&inputs)
            ))
        }
        ToolFamily::MarketData => keyed_fields(params, &["symbol", "fiscal_year"]),
        ToolFamily::Filing => keyed_fields(params, &["symbol", "fiscal_year", "document_type"]),
        ToolFamily::Search => {
            let query = params.get("query").and_then(Value::as_str).unwrap_or("");
            sha256_hex(&normalize_text(query))
        }
        ToolFamily::Other => sha256_hex(&format!(
            "{}\u{0}{}",
            input.tool_name,
            canonical_json(params)
        )),
    };

    (family, key)
}

/// Sorted key=value pairs over the declared output-affecting subset;
/// anything else a caller passes (display hints, etc.) is excluded.
fn keyed_fields(params: &Value, fields: &[&str]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .map(|f| {
            let rendered = params
                .get(*f)
                .map(canonical_json)
                .unwrap_or_else(|| "-".to_string());
            format!("{}={}", f, rendered)
        })
        .collect();
    parts.join("&")
}

//
// ================= Records and cache =================

/// A stored tool call. Immutable once cached; lifetime is one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub family: ToolFamily,
    pub canonical_key: String,
    pub parameters: Value,
    pub payload: Value,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn from_output(input: &ToolInput, output: &ToolOutput) -> Self {
        let (family, key) = canonical_key(input);
        Self {
            tool_name: input.tool_name.clone(),
            family,
            canonical_key: key,
            parameters: input.parameters.clone(),
            payload: if output.success {
                output.data.clone()
            } else {
                serde_json::json!({ "error": output.error })
            },
            success: output.success,
            created_at: Utc::now(),
        }
    }

    pub fn to_output(&self) -> ToolOutput {
        if self.success {
            ToolOutput::ok(self.payload.clone())
        } else {
            ToolOutput::failed(
                self.payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("cached failure")
                    .to_string(),
            )
        }
    }
}

/// Per-run tool result cache. Never shared mutably across concurrent
/// runs; each run owns its own instance.
pub struct ToolCache {
    entries: RwLock<HashMap<(ToolFamily, String), ToolCallRecord>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, family: ToolFamily, key: &str) -> Option<ToolCallRecord> {
        let entries = self.entries.read().await;
        match entries.get(&(family, key.to_string())) {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check that does not touch the hit/miss counters; used by
    /// speculative warming so stats reflect real lookups only.
    pub async fn contains(&self, family: ToolFamily, key: &str) -> bool {
        self.entries
            .read()
            .await
            .contains_key(&(family, key.to_string()))
    }

    /// Store a record. Entries are write-once: a second put for the same
    /// key keeps the original payload.
    pub async fn put(&self, record: ToolCallRecord) {
        let mut entries = self.entries.write().await;
        let slot = (record.family, record.canonical_key.clone());
        if entries.contains_key(&slot) {
            warn!(
                family = %record.family,
                key = %record.canonical_key,
                "Ignoring second write for cached key"
            );
            return;
        }
        entries.insert(slot, record);
    }

    /// Speculative warm-up between the current-period and prior-period
    /// stages: issue the lookups synthesis is statistically likely to
    /// need, skipping keys already present.
    pub async fn warm(
        &self,
        subject: &str,
        fiscal_years: &[i64],
        registry: &ToolRegistry,
    ) -> usize {
        let Some(tool) = registry.get("market_snapshot") else {
            return 0;
        };

        let mut warmed = 0;
        for year in fiscal_years {
            let input = ToolInput {
                tool_name: "market_snapshot".to_string(),
                parameters: serde_json::json!({ "symbol": subject, "fiscal_year": year }),
            };
            let (family, key) = canonical_key(&input);
            if self.contains(family, &key).await {
                continue;
            }

            let output = match tool.execute(&input).await {
                Ok(output) => output,
                Err(e) => ToolOutput::failed(e.to_string()),
            };
            self.put(ToolCallRecord::from_output(&input, &output)).await;
            warmed += 1;
        }

        debug!(subject, warmed, "Cache warm-up complete");
        warmed
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let mut items_by_family: HashMap<String, usize> = HashMap::new();
        for (family, _) in entries.keys() {
            *items_by_family.entry(family.as_str().to_string()).or_insert(0) += 1;
        }

        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            items_by_family,
        }
    }

    /// All successful records in a family, for read-only consumers
    /// (extractor overrides, validator critic digest).
    pub async fn successful_in_family(&self, family: ToolFamily) -> Vec<ToolCallRecord> {
        self.entries
            .read()
            .await
            .values()
            .filter(|r| r.family == family && r.success)
            .cloned()
            .collect()
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Caching executor =================
//

/// Tool executor that consults the cache before dispatching to the
/// registry. Failures are returned as structured outputs (visible to
/// the model) and cached tagged; lookups hit exactly one underlying
/// execution per canonical key per run.
pub struct CachingExecutor<'a> {
    cache: &'a ToolCache,
    registry: &'a ToolRegistry,
}

impl<'a> CachingExecutor<'a> {
    pub fn new(cache: &'a ToolCache, registry: &'a ToolRegistry) -> Self {
        Self { cache, registry }
    }
}

#[async_trait::async_trait]
impl crate::provider::ToolExecutor for CachingExecutor<'_> {
    async fn execute(&self, input: &ToolInput) -> ToolOutput {
        let (family, key) = canonical_key(input);

        if let Some(record) = self.cache.get(family, &key).await {
            debug!(tool = %input.tool_name, family = %family, "Cache hit");
            return record.to_output();
        }

        let output = match self.registry.get(&input.tool_name) {
            Some(tool) => match tool.execute(input).await {
                Ok(output) => output,
                Err(e) => ToolOutput::failed(e.to_string()),
            },
            None => ToolOutput::failed(format!("tool '{}' is not registered", input.tool_name)),
        };

        self.cache
            .put(ToolCallRecord::from_output(input, &output))
            .await;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{MarketSnapshotTool, Tool, ToolRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn calc_input(computation: &str, inputs: Value) -> ToolInput {
        ToolInput {
            tool_name: "calculator".to_string(),
            parameters: json!({ "computation": computation, "inputs": inputs }),
        }
    }

    #[test]
    fn test_calculator_keys_distinct_per_computation() {
        // Two differently-shaped computations must never collapse to one
        // stored entry, even with identical numeric inputs.
        let (_, returns_key) =
            canonical_key(&calc_input("returns", json!({ "nopat": 5.0, "invested_capital": 50.0 })));
        let (_, valuation_key) =
            canonical_key(&calc_input("valuation", json!({ "nopat": 5.0, "invested_capital": 50.0 })));
        assert_ne!(returns_key, valuation_key);
    }

    #[test]
    fn test_calculator_key_ignores_whitespace_and_case() {
        let (_, a) = canonical_key(&calc_input("RETURNS", json!({ "note": "Use  TTM data" })));
        let (_, b) = canonical_key(&calc_input("returns", json!({ "note": "use ttm data" })));
        assert_eq!(a, b);
    }

    #[test]
    fn test_market_data_key_excludes_irrelevant_params() {
        let a = canonical_key(&ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
        });
        let b = canonical_key(&ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023, "verbose": true }),
        });
        assert_eq!(a, b);

        let c = canonical_key(&ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2022 }),
        });
        assert_ne!(a.1, c.1);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_unchanged_payload() {
        let cache = ToolCache::new();
        let input = ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
        };
        let output = ToolOutput::ok(json!({ "revenue": 1000.0 }));
        let record = ToolCallRecord::from_output(&input, &output);
        let (family, key) = canonical_key(&input);

        assert!(cache.get(family, &key).await.is_none());
        cache.put(record).await;

        let hit = cache.get(family, &key).await.unwrap();
        assert_eq!(hit.payload, json!({ "revenue": 1000.0 }));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_entries_are_write_once() {
        let cache = ToolCache::new();
        let input = ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
        };
        let (family, key) = canonical_key(&input);

        cache
            .put(ToolCallRecord::from_output(&input, &ToolOutput::ok(json!({ "v": 1 }))))
            .await;
        cache
            .put(ToolCallRecord::from_output(&input, &ToolOutput::ok(json!({ "v": 2 }))))
            .await;

        let record = cache.get(family, &key).await.unwrap();
        assert_eq!(record.payload, json!({ "v": 1 }));
    }

    #[tokio::test]
    async fn test_failures_are_cached_tagged() {
        let cache = ToolCache::new();
        let input = ToolInput {
            tool_name: "filing_excerpt".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2020 }),
        };
        let (family, key) = canonical_key(&input);

        cache
            .put(ToolCallRecord::from_output(
                &input,
                &ToolOutput::failed("no filing available"),
            ))
            .await;

        let record = cache.get(family, &key).await.unwrap();
        assert!(!record.success);
        assert!(!record.to_output().success);
    }

    #[tokio::test]
    async fn test_warm_skips_present_keys_and_spares_stats() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MarketSnapshotTool));

        let cache = ToolCache::new();

        // Pre-populate 2023 so warming only fills 2022.
        let input = ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
        };
        let output = MarketSnapshotTool.execute(&input).await.unwrap();
        cache.put(ToolCallRecord::from_output(&input, &output)).await;

        let warmed = cache.warm("ACME", &[2023, 2022], &registry).await;
        assert_eq!(warmed, 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.items_by_family.get("market_data"), Some(&2));
    }

    struct CountingTool {
        executions: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &'static str {
            "market_snapshot"
        }

        fn description(&self) -> &'static str {
            "counting stub"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }

        async fn execute(&self, _input: &ToolInput) -> crate::Result<ToolOutput> {
            self.executions.fetch_add(1, Ordering::Relaxed);
            Ok(ToolOutput::ok(serde_json::json!({ "revenue": 1000.0 })))
        }
    }

    #[tokio::test]
    async fn test_executor_repeats_hit_with_one_underlying_execution() {
        use crate::provider::ToolExecutor;

        let tool = Arc::new(CountingTool {
            executions: std::sync::atomic::AtomicU64::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());

        let cache = ToolCache::new();
        let executor = CachingExecutor::new(&cache, &registry);
        let input = ToolInput {
            tool_name: "market_snapshot".to_string(),
            parameters: json!({ "symbol": "ACME", "fiscal_year": 2023 }),
        };

        let first = executor.execute(&input).await;
        let second = executor.execute(&input).await;

        assert_eq!(first.data, second.data);
        assert_eq!(tool.executions.load(Ordering::Relaxed), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
