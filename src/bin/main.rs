//! Demo binary: run one analysis end to end.
//!
//! With GEMINI_API_KEY set the run goes through the live Gemini
//! adapter; otherwise a scripted provider replays a canned session so
//! the pipeline can be exercised offline.

use investment_analysis_orchestrator::models::StageProgress;
use investment_analysis_orchestrator::orchestrator::{AnalysisRequest, StageOrchestrator};
use investment_analysis_orchestrator::provider::{
    GeminiAdapter, ProviderAdapter, ScriptedProvider, ScriptedReply,
};
use investment_analysis_orchestrator::tools::create_stub_registry;
use investment_analysis_orchestrator::Result;
use serde_json::json;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let subject = args.next().unwrap_or_else(|| "ACME".to_string());
    let year: i64 = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2024);

    let (provider, critic): (Arc<dyn ProviderAdapter>, Arc<dyn ProviderAdapter>) =
        match env::var("GEMINI_API_KEY") {
            Ok(key) => {
                info!("Using Gemini adapter");
                let adapter: Arc<dyn ProviderAdapter> = Arc::new(GeminiAdapter::new(key)?);
                (adapter.clone(), adapter)
            }
            Err(_) => {
                info!("GEMINI_API_KEY not set; replaying a scripted session");
                (scripted_session(&subject, year), scripted_critic())
            }
        };

    let orchestrator = StageOrchestrator::new(provider, critic, Arc::new(create_stub_registry()))
        .with_progress(Arc::new(|p: StageProgress| {
            println!("[{:>5.1}%] {} - {}", p.fraction * 100.0, p.stage, p.message);
        }));

    let result = orchestrator
        .analyze(AnalysisRequest::new(&subject, year).with_prior_periods(2))
        .await?;

    println!();
    println!("subject:    {}", result.subject);
    println!("outcome:    {:?}", result.outcome);
    if let Some(decision) = result.decision {
        println!("decision:   {}", decision);
    }
    if let Some(conviction) = result.conviction {
        println!("conviction: {}", conviction);
    }
    println!(
        "periods:    {} analyzed, {} gaps",
        result.periods.len(),
        result.period_gaps.len()
    );
    if let Some(stats) = &result.cache_stats {
        println!(
            "cache:      {} hits / {} misses ({:.0}% hit rate)",
            stats.hits,
            stats.misses,
            stats.hit_rate * 100.0
        );
    }
    println!("tokens:     {}", result.token_usage.total());
    println!();
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn scripted_session(subject: &str, year: i64) -> Arc<dyn ProviderAdapter> {
    let block = |narrative: &str, metrics: serde_json::Value, insights: serde_json::Value| {
        format!(
            "{}\n```analysis-data\n{}\n```",
            narrative,
            json!({ "metrics": metrics, "insights": insights })
        )
    };

    let period = |y: i64, margin: f64| {
        ScriptedReply::with_tools(
            vec![investment_analysis_orchestrator::models::ToolInput {
                tool_name: "market_snapshot".to_string(),
                parameters: json!({ "symbol": subject, "fiscal_year": y }),
            }],
            block(
                &format!(
                    "FY{} execution stayed disciplined; pricing held through the cycle.",
                    y
                ),
                json!({ "gross_margin": margin + 0.24, "operating_margin": margin, "net_margin": margin - 0.08 }),
                json!({ "moat": "narrow", "risk": "low",
                        "strengths": ["Contracted revenue covers most of the fiscal year"] }),
            ),
        )
    };

    Arc::new(ScriptedProvider::new(vec![
        period(year, 0.31),
        period(year - 1, 0.30),
        period(year - 2, 0.29),
        ScriptedReply::text_only(block(
            "Operating margins firmed modestly across the window while returns on \
             capital stayed comfortably above the cost of capital. The balance sheet \
             carries little leverage and the valuation leaves room for error.",
            json!({ "operating_margin": 0.31, "return_on_capital": 0.16, "debt_to_equity": 0.6 }),
            json!({ "decision": "BUY", "conviction": "moderate", "moat": "narrow", "risk": "low" }),
        )),
    ]))
}

fn scripted_critic() -> Arc<dyn ProviderAdapter> {
    Arc::new(ScriptedProvider::new(vec![ScriptedReply::text_only(
        r#"{"score": 88, "findings": []}"#,
    )]))
}
