//! Gemini-backed provider adapter
//!
//! Function-calling agentic loop over the Gemini REST API.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{AgenticRequest, LoopOutcome, ProviderAdapter, ToolExecutor, ToolInvocation, ToolSpec};
use crate::error::EngineError;
use crate::models::{TokenUsage, ToolInput};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hard cap on model-turn/tool-turn alternations per stage.
const MAX_TOOL_ITERATIONS: usize = 12;
/// Transient transport failures retried before the run aborts.
const MAX_TRANSPORT_RETRIES: u32 = 2;
const RETRY_BACKOFF_MS: u64 = 400;

/// Reusable Gemini adapter (connection-pooled)
pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    context_window: usize,
}

impl GeminiAdapter {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
            context_window: 1_000_000,
        })
    }

    async fn request_once(&self, request: &GeminiRequest) -> Result<GeminiResponse> {
        let url = format!("{}?key={}", self.base_url, self.api_key);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::ProviderTransport(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::ProviderTransport(format!(
                "Gemini returned {}",
                status
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(EngineError::InvalidResponse(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        response.json::<GeminiResponse>().await.map_err(|e| {
            EngineError::InvalidResponse(format!("Gemini parse error: {}", e))
        })
    }

    /// Bounded retry on transient transport errors; other errors pass through.
    async fn request_with_retry(&self, request: &GeminiRequest) -> Result<GeminiResponse> {
        let mut attempt = 0;
        loop {
            match self.request_once(request).await {
                Ok(resp) => return Ok(resp),
                Err(EngineError::ProviderTransport(msg)) if attempt < MAX_TRANSPORT_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "Transient Gemini transport error: {}", msg);
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_request(
        system_prompt: &str,
        contents: Vec<Content>,
        tools: &[ToolSpec],
    ) -> GeminiRequest {
        let tool_decls = if tools.is_empty() {
            None
        } else {
            Some(vec![ToolDeclarations {
                function_declarations: tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        GeminiRequest {
            contents,
            tools: tool_decls,
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8192,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part::text(system_prompt)],
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn run_agentic_loop(
        &self,
        request: AgenticRequest<'_>,
        executor: &dyn ToolExecutor,
    ) -> Result<LoopOutcome> {
        if self.api_key.is_empty() {
            return Err(EngineError::ProviderTransport(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let mut contents = vec![Content::user(request.initial_message)];
        let mut trace: Vec<ToolInvocation> = Vec::new();
        let mut usage = TokenUsage::default();

        for iteration in 0..MAX_TOOL_ITERATIONS {
            if let Some(flag) = &request.cancelled {
                if flag.load(Ordering::Relaxed) {
                    return Err(EngineError::Cancelled("agentic loop".to_string()));
                }
            }

            let wire =
                Self::build_request(request.system_prompt, contents.clone(), request.tools);

            debug!(iteration, "Calling Gemini");
            let response = self.request_with_retry(&wire).await?;

            if let Some(meta) = &response.usage_metadata {
                usage.add(TokenUsage {
                    prompt_tokens: meta.prompt_token_count.max(0) as u64,
                    completion_tokens: meta.candidates_token_count.max(0) as u64,
                });
            }

            let candidate = response.candidates.into_iter().next().ok_or_else(|| {
                EngineError::InvalidResponse("no candidates from Gemini".to_string())
            })?;

            let function_calls: Vec<FunctionCall> = candidate
                .content
                .parts
                .iter()
                .filter_map(|p| p.function_call.clone())
                .collect();

            // Text-only turn ends the loop.
            if function_calls.is_empty() {
                let text: String = candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n");

                info!(
                    iterations = iteration + 1,
                    tool_calls = trace.len(),
                    "Agentic loop complete"
                );

                return Ok(LoopOutcome { text, trace, usage });
            }

            // Model turn goes back into the transcript, then every call is
            // executed sequentially and answered before the next model turn.
            contents.push(Content {
                role: "model".to_string(),
                parts: candidate.content.parts.clone(),
            });

            for call in function_calls {
                let input = ToolInput {
                    tool_name: call.name.clone(),
                    parameters: call.args.clone(),
                };

                let output = executor.execute(&input).await;
                trace.push(ToolInvocation {
                    input: input.clone(),
                    success: output.success,
                });

                let response_payload = if output.success {
                    serde_json::json!({ "success": true, "data": output.data })
                } else {
                    // Structured error so the model can retry or adjust.
                    serde_json::json!({
                        "success": false,
                        "error": output.error.unwrap_or_else(|| "tool failed".to_string()),
                    })
                };

                contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part {
                        text: None,
                        function_call: None,
                        function_response: Some(FunctionResponse {
                            name: call.name,
                            response: response_payload,
                        }),
                    }],
                });
            }
        }

        Err(EngineError::IterationsExhausted(format!(
            "no final answer after {} tool iterations",
            MAX_TOOL_ITERATIONS
        )))
    }

    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(EngineError::ProviderTransport(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let wire = Self::build_request(system_prompt, vec![Content::user(prompt)], &[]);
        let response = self.request_with_retry(&wire).await?;

        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            EngineError::InvalidResponse("no candidates from Gemini".to_string())
        })?;

        Ok(candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

//
// ================= Wire types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn user(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(s: &str) -> Self {
        Self {
            text: Some(s.to_string()),
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    #[serde(rename = "finishReason")]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}
