// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use std::time::Duration;

use async_trait::async_trait;
use llm_contracts::{
    ChatMessage, CompletionRequest, CompletionResponse, LLMError, LLMResult, ProviderMessage,
    ProviderRequest, ProviderResponse, Usage,
};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::{Result, SlateError};
use crate::llm::CompletionAdapter;

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "SLATE_API_KEY";
/// Environment variable overriding the completion endpoint.
pub const API_URL_ENV: &str = "SLATE_API_URL";

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Transport-level retries inside one `complete` call. Semantic retries
/// across generations belong to the orchestrator, not this client.
const TRANSPORT_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    timeout: Duration,
    transport_retries: u32,
}

impl OpenAiAdapter {
    pub fn new(
        api_key: String,
        endpoint: Option<String>,
        model: String,
        timeout_seconds: u64,
        transport_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SlateError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model,
            timeout,
            transport_retries,
        })
    }

    /// Reads the key from `SLATE_API_KEY` and an optional endpoint
    /// override from `SLATE_API_URL`.
    pub fn from_env(config: &AgentConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| SlateError::MissingApiKey)?;
        let endpoint = std::env::var(API_URL_ENV).ok();
        Self::new(
            api_key,
            endpoint,
            config.model.clone(),
            config.request_timeout_secs,
            TRANSPORT_RETRIES,
        )
    }

    fn to_provider_request(&self, request: &CompletionRequest) -> ProviderRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(ProviderMessage {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m: &ChatMessage| ProviderMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));
        ProviderRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.generation_config.max_tokens,
            temperature: request.generation_config.temperature,
            top_p: request.generation_config.top_p,
            stop_sequences: request.generation_config.stop_sequences.clone(),
            stream: Some(false),
            provider_specific: std::collections::HashMap::new(),
        }
    }

    fn build_payload(&self, request: &ProviderRequest) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages.iter().map(|msg| {
                json!({
                    "role": msg.role,
                    "content": msg.content
                })
            }).collect::<Vec<_>>()
        });

        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            payload["stop"] = json!(stop);
        }
        if let Some(stream) = request.stream {
            payload["stream"] = json!(stream);
        }

        payload
    }

    fn parse_response(&self, response_data: Value, model: String) -> LLMResult<ProviderResponse> {
        let content = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LLMError::Provider("failed to extract content from provider response".to_string())
            })?;

        let usage = if let Some(usage_data) = response_data.get("usage") {
            Usage {
                prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
            }
        } else {
            Usage::default()
        };

        let finish_reason = response_data["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        Ok(ProviderResponse {
            content: content.to_string(),
            model,
            usage,
            finish_reason,
            raw_response: response_data,
        })
    }

    async fn execute_with_retry(&self, payload: Value) -> LLMResult<Value> {
        let mut last_error = None;

        for attempt in 0..=self.transport_retries {
            debug!(
                attempt = attempt + 1,
                attempts = self.transport_retries + 1,
                "sending completion request"
            );

            let response = tokio::time::timeout(
                self.timeout,
                self.client
                    .post(&self.endpoint)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&payload)
                    .send(),
            )
            .await;

            match response {
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(data) => return Ok(data),
                            Err(e) => {
                                last_error = Some(LLMError::Serialisation(format!(
                                    "failed to parse JSON response: {e}"
                                )));
                            }
                        }
                    } else if status.as_u16() == 429 {
                        let wait = Duration::from_secs(2_u64.pow(attempt.min(5)));
                        warn!(?wait, "rate limited by provider, backing off");
                        tokio::time::sleep(wait).await;
                        last_error = Some(LLMError::RateLimit);
                    } else if status.as_u16() == 401 || status.as_u16() == 403 {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(LLMError::Authentication(format!(
                            "provider rejected credentials ({status}): {body}"
                        )));
                    } else {
                        let body = resp.text().await.unwrap_or_default();
                        last_error =
                            Some(LLMError::Provider(format!("provider error {status}: {body}")));
                    }
                }
                Ok(Err(e)) => {
                    last_error = Some(LLMError::Network(format!("request failed: {e}")));
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.timeout.as_secs(),
                        "completion request timed out"
                    );
                    last_error = Some(LLMError::Timeout);
                }
            }

            if attempt < self.transport_retries {
                tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt.min(3)))).await;
            }
        }

        Err(last_error.unwrap_or_else(|| LLMError::Internal("unknown transport error".to_string())))
    }
}

#[async_trait]
impl CompletionAdapter for OpenAiAdapter {
    async fn complete(&self, request: CompletionRequest) -> LLMResult<CompletionResponse> {
        let provider_request = self.to_provider_request(&request);
        let payload = self.build_payload(&provider_request);
        let started = std::time::Instant::now();
        let response_data = self.execute_with_retry(payload).await?;
        let provider_response = self.parse_response(response_data, provider_request.model)?;

        let mut response = CompletionResponse::new(request.id, provider_response.content);
        response.model_used = provider_response.model;
        response.provider_used = self.provider_name().to_string();
        response.usage = provider_response.usage;
        response.metadata.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
