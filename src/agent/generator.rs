use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::feedback::Feedback;
use super::prompt::{SYSTEM_PROMPT, extract_code, generation_prompt};
use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::config::GenerationConfig;
use crate::language::Language;
use crate::state_machine::{RetryConfig, TaskSpec};

#[derive(Debug, Error)]
pub enum GenerationError {
    /// The generation capability could not be reached after internal retries.
    #[error("generation unavailable after {attempts} call(s): {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: AnthropicError,
    },

    /// The model answered but no source code could be extracted.
    #[error("generation returned no usable source code")]
    NoArtifact,
}

/// Produces a candidate source artifact for a task.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        task: &TaskSpec,
        language: Language,
        feedback: Option<&Feedback>,
    ) -> Result<String, GenerationError>;
}

/// Generator backed by an LLM Messages endpoint.
pub struct LlmGenerator<C> {
    client: C,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
}

impl<C: MessageSender> LlmGenerator<C> {
    pub fn new(client: C, config: &GenerationConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry: config.backoff(),
        }
    }

    fn request(&self, prompt: String) -> MessagesRequest {
        MessagesRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            temperature: Some(self.temperature),
            ..MessagesRequest::user(self.model.clone(), self.max_tokens, prompt)
        }
    }
}

#[async_trait]
impl<C: MessageSender> Generator for LlmGenerator<C> {
    async fn generate(
        &self,
        task: &TaskSpec,
        language: Language,
        feedback: Option<&Feedback>,
    ) -> Result<String, GenerationError> {
        let request = self.request(generation_prompt(task, language, feedback));

        let mut calls = 0;
        let reply = loop {
            calls += 1;
            match self.client.send_message(&request).await {
                Ok(response) => break response.text(),
                Err(e) if e.is_retryable() && calls <= self.retry.max_retries => {
                    let delay_ms = e
                        .retry_after_ms()
                        .unwrap_or_else(|| self.retry.delay_for_attempt(calls));
                    warn!(%language, call = calls, delay_ms, error = %e, "generation call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    return Err(GenerationError::Unavailable {
                        attempts: calls,
                        source: e,
                    });
                }
            }
        };

        let code = extract_code(&reply, language);
        if code.is_empty() {
            return Err(GenerationError::NoArtifact);
        }
        debug!(%language, bytes = code.len(), calls, "candidate generated");
        Ok(code)
    }
}
