//! Provider-agnostic orchestration engine for multi-period investment
//! analysis.
//!
//! One run walks a fixed stage sequence (current fiscal period, prior
//! periods, synthesis, validation), calling an LLM through the
//! [`provider::ProviderAdapter`] seam and domain tools through the
//! [`tools::Tool`] registry. Tool results are cached per run under
//! canonical keys, stage inputs are admitted against a token budget,
//! and the final result passes a deterministic-plus-critic validation
//! loop with bounded refinement.
//!
//! ```no_run
//! use std::sync::Arc;
//! use investment_analysis_orchestrator::orchestrator::{AnalysisRequest, StageOrchestrator};
//! use investment_analysis_orchestrator::provider::GeminiAdapter;
//! use investment_analysis_orchestrator::tools::create_stub_registry;
//!
//! # async fn run() -> investment_analysis_orchestrator::Result<()> {
//! let provider = Arc::new(GeminiAdapter::new("api-key".to_string())?);
//! let orchestrator = StageOrchestrator::new(
//!     provider.clone(),
//!     provider,
//!     Arc::new(create_stub_registry()),
//! );
//! let result = orchestrator.analyze(AnalysisRequest::new("ACME", 2024)).await?;
//! println!("{:?} {:?}", result.decision, result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod cache;
pub mod error;
pub mod extractor;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod tools;
pub mod validator;

pub use error::{EngineError, Result};
pub use models::{AnalysisResult, Decision, RunOutcome};
pub use orchestrator::{AnalysisRequest, StageOrchestrator};
