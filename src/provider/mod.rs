//! Provider adapter seam
//!
//! Uniform contract over heterogeneous LLM backends. The orchestrator
//! holds only this interface, never a provider name; backend-specific
//! branching lives inside each adapter.

use crate::models::{TokenUsage, ToolInput, ToolOutput};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiAdapter;

/// Tool advertised to the model: name, description, and a JSON-schema
/// object for its parameters. Declared once per tool, per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One tool round-trip recorded during an agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub input: ToolInput,
    pub success: bool,
}

/// Final product of one agentic loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub text: String,
    pub trace: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

/// Inputs for one agentic loop.
pub struct AgenticRequest<'a> {
    pub system_prompt: &'a str,
    pub initial_message: &'a str,
    pub tools: &'a [ToolSpec],
    /// Cooperative cancellation, checked between tool-call iterations;
    /// an in-flight call is allowed to finish.
    pub cancelled: Option<Arc<AtomicBool>>,
}

/// Executes a tool call on behalf of the model. Failures are encoded in
/// the returned [`ToolOutput`] so the model can see them and retry.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, input: &ToolInput) -> ToolOutput;
}

/// Contract every LLM backend implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Context window in tokens (prompt + output).
    fn context_window(&self) -> usize;

    /// Run one agentic loop: strict model-turn/tool-turn alternation
    /// until the model answers with text only or the iteration cap hits.
    async fn run_agentic_loop(
        &self,
        request: AgenticRequest<'_>,
        executor: &dyn ToolExecutor,
    ) -> Result<LoopOutcome>;

    /// Single tool-free completion (summarization, critique).
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String>;
}

//
// ================= Scripted provider =================
//

/// One scripted model turn: tool calls to issue, then the final text.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub tool_calls: Vec<ToolInput>,
    pub text: String,
}

impl ScriptedReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self { tool_calls: Vec::new(), text: text.into() }
    }

    pub fn with_tools(tool_calls: Vec<ToolInput>, text: impl Into<String>) -> Self {
        Self { tool_calls, text: text.into() }
    }
}

/// Deterministic provider stub for tests and offline runs.
/// Replies are consumed in order; identical scripts yield identical runs.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    window: usize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            window: 1_000_000,
        }
    }

    pub fn with_window(replies: Vec<ScriptedReply>, window: usize) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            window,
        }
    }

    async fn next_reply(&self) -> Result<ScriptedReply> {
        self.replies.lock().await.pop_front().ok_or_else(|| {
            crate::error::EngineError::InvalidResponse("scripted provider exhausted".to_string())
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn context_window(&self) -> usize {
        self.window
    }

    async fn run_agentic_loop(
        &self,
        request: AgenticRequest<'_>,
        executor: &dyn ToolExecutor,
    ) -> Result<LoopOutcome> {
        let reply = self.next_reply().await?;
        let mut trace = Vec::with_capacity(reply.tool_calls.len());

        for call in &reply.tool_calls {
            if let Some(flag) = &request.cancelled {
                if flag.load(Ordering::Relaxed) {
                    return Err(crate::error::EngineError::Cancelled("scripted".to_string()));
                }
            }
            let output = executor.execute(call).await;
            trace.push(ToolInvocation {
                input: call.clone(),
                success: output.success,
            });
        }

        let usage = TokenUsage {
            prompt_tokens: (crate::budget::estimate_tokens(request.system_prompt)
                + crate::budget::estimate_tokens(request.initial_message)) as u64,
            completion_tokens: crate::budget::estimate_tokens(&reply.text) as u64,
        };

        Ok(LoopOutcome {
            text: reply.text,
            trace,
            usage,
        })
    }

    async fn complete(&self, _system_prompt: &str, _prompt: &str) -> Result<String> {
        Ok(self.next_reply().await?.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, input: &ToolInput) -> ToolOutput {
            ToolOutput::ok(json!({ "echo": input.tool_name }))
        }
    }

    #[tokio::test]
    async fn test_scripted_loop_runs_tools_then_finishes() {
        let provider = ScriptedProvider::new(vec![ScriptedReply::with_tools(
            vec![ToolInput {
                tool_name: "market_snapshot".to_string(),
                parameters: json!({ "symbol": "ACME" }),
            }],
            "Final answer.",
        )]);

        let outcome = provider
            .run_agentic_loop(
                AgenticRequest {
                    system_prompt: "system",
                    initial_message: "analyze",
                    tools: &[],
                    cancelled: None,
                },
                &EchoExecutor,
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "Final answer.");
        assert_eq!(outcome.trace.len(), 1);
        assert!(outcome.trace[0].success);
        assert!(outcome.usage.total() > 0);
    }

    #[tokio::test]
    async fn test_scripted_provider_exhaustion_is_an_error() {
        let provider = ScriptedProvider::new(vec![]);
        let result = provider.complete("s", "p").await;
        assert!(result.is_err());
    }
}
