//! Answer-generation providers.
//!
//! [`Llm`] is the capability the query pipeline depends on; the engine
//! ships an HTTP chat-completions client and a deterministic [`NullLlm`]
//! for tests and offline use. Prompt assembly lives here too so every
//! provider receives the same strict-grounding instructions.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::embedding::backoff_delay;
use crate::error::{Error, Result};

/// Phrase emitted when the context does not support an answer. The
/// confidence scorer keys off this wording.
pub const INSUFFICIENT_PHRASE: &str =
    "The provided documents do not contain enough information to answer that.";

pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub answer: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl LlmReply {
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmReply>;

    fn model_name(&self) -> &str;
}

/// Assemble the grounded prompt: instructions, delimited context blocks,
/// then the question.
pub fn build_request(context_blocks: &[String], question: &str, config: &LlmConfig) -> LlmRequest {
    let system = format!(
        "You are a document question-answering assistant. Answer using ONLY \
         the passages between the CONTEXT markers. Do not use outside \
         knowledge and do not speculate. If the passages do not contain the \
         answer, reply exactly: \"{}\"",
        INSUFFICIENT_PHRASE
    );

    let mut user = String::from("=== CONTEXT START ===\n");
    for (i, block) in context_blocks.iter().enumerate() {
        user.push_str(&format!("[passage {}]\n{}\n\n", i + 1, block));
    }
    user.push_str("=== CONTEXT END ===\n\nQuestion: ");
    user.push_str(question);

    LlmRequest {
        system,
        user,
        temperature: config.temperature.clamp(0.0, 1.0),
        max_output_tokens: config.max_output_tokens,
    }
}

// ============ Null Provider ============

/// Deterministic provider used in tests and degraded mode: extracts the
/// leading sentences of the context instead of calling a model.
pub struct NullLlm;

const NULL_ANSWER_BUDGET: usize = 80;

#[async_trait]
impl Llm for NullLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        let context = request
            .user
            .split("=== CONTEXT END ===")
            .next()
            .unwrap_or("")
            .trim_start_matches("=== CONTEXT START ===")
            .trim();

        let body: String = context
            .lines()
            .filter(|line| !line.starts_with("[passage"))
            .collect::<Vec<_>>()
            .join(" ");

        let prompt_tokens = request.user.split_whitespace().count() as i64;

        if body.trim().is_empty() {
            return Ok(LlmReply {
                answer: INSUFFICIENT_PHRASE.to_string(),
                prompt_tokens,
                completion_tokens: INSUFFICIENT_PHRASE.split_whitespace().count() as i64,
            });
        }

        let words: Vec<&str> = body.split_whitespace().collect();
        let answer = words
            .iter()
            .take(NULL_ANSWER_BUDGET)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");

        Ok(LlmReply {
            completion_tokens: answer.split_whitespace().count() as i64,
            answer,
            prompt_tokens,
        })
    }

    fn model_name(&self) -> &str {
        "null"
    }
}

// ============ HTTP Provider ============

/// Chat-completions client (OpenAI wire shape).
pub struct HttpLlm {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl HttpLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| Error::Config("llm.api_base required".into()))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("llm.model required".into()))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::Config(format!("{} environment variable not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_base,
            api_key,
            model,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Llm for HttpLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        });

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.api_base))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::LlmFailure(e.to_string()))?;
                        return parse_chat_response(&json);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = Error::LlmFailure(format!("{}: {}", status, body_text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(Error::DeadlineExceeded("llm call timed out".into()));
                    continue;
                }
                Err(e) => {
                    last_err = Some(Error::LlmFailure(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::LlmFailure("llm failed after retries".into())))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<LlmReply> {
    let answer = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::LlmFailure("response missing choices[0].message.content".into()))?
        .to_string();

    let usage = json.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    Ok(LlmReply {
        answer,
        prompt_tokens,
        completion_tokens,
    })
}

/// Build the LLM provider named by the configuration.
pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn Llm>> {
    match config.provider.as_str() {
        "null" => Ok(Box::new(NullLlm)),
        "http" => Ok(Box::new(HttpLlm::new(config)?)),
        other => Err(Error::Config(format!("unknown llm provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_llm_echoes_context() {
        let config = LlmConfig::default();
        let request = build_request(
            &["The warranty period is two years.".to_string()],
            "How long is the warranty?",
            &config,
        );
        let reply = NullLlm.complete(&request).await.unwrap();
        assert!(reply.answer.contains("warranty period"));
        assert!(reply.completion_tokens > 0);
    }

    #[tokio::test]
    async fn null_llm_reports_insufficiency_without_context() {
        let config = LlmConfig::default();
        let request = build_request(&[], "Anything?", &config);
        let reply = NullLlm.complete(&request).await.unwrap();
        assert_eq!(reply.answer, INSUFFICIENT_PHRASE);
    }

    #[test]
    fn request_contains_delimited_context_and_question() {
        let config = LlmConfig::default();
        let request = build_request(
            &["block one".to_string(), "block two".to_string()],
            "the question",
            &config,
        );
        assert!(request.system.contains("ONLY"));
        assert!(request.user.contains("[passage 1]\nblock one"));
        assert!(request.user.contains("[passage 2]\nblock two"));
        assert!(request.user.ends_with("Question: the question"));
    }

    #[test]
    fn parses_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "grounded answer" } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 8 }
        });
        let reply = parse_chat_response(&json).unwrap();
        assert_eq!(reply.answer, "grounded answer");
        assert_eq!(reply.total_tokens(), 128);
    }
}
