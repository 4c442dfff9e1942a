//! Grounded answer generation.
//!
//! Builds a grounding prompt from the retrieved chunk texts and invokes an
//! OpenAI-compatible chat-completions backend (Groq by default). The call
//! is a single request/response; delivery chunking, if any, is the session
//! layer's concern.
//!
//! Failure contract:
//! - missing API key, network error, or timeout → `GenerationUnavailable`
//! - any backend-reported error status → `GenerationFailed`

use async_trait::async_trait;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{ChatError, Result};

/// Request/response text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce an answer to `query` grounded in `context` passages.
    async fn generate(&self, query: &str, context: &[String]) -> Result<String>;
}

/// System instruction prefix for grounded answering.
const SYSTEM_INSTRUCTIONS: &str = "You are a helpful assistant that answers questions based on \
the provided context. The context comes from the user's uploaded documents.\n\
\n\
Guidelines:\n\
1. Answer only from the provided context.\n\
2. If the context does not contain the relevant information, say so explicitly.\n\
3. Be concise and accurate.\n\
4. Cite the context passages you used when they are locatable.";

/// Build the system message embedding every context passage, each
/// independently delimited.
pub fn grounding_prompt(context: &[String]) -> String {
    let mut prompt = String::from(SYSTEM_INSTRUCTIONS);
    prompt.push_str("\n\nContext:\n");
    for (i, passage) in context.iter().enumerate() {
        prompt.push_str(&format!("\n[passage {}]\n{}\n", i + 1, passage));
    }
    prompt
}

/// Generator backed by an OpenAI-compatible `POST /chat/completions`
/// endpoint with a fixed decoding temperature.
pub struct ChatCompletionGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl ChatCompletionGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::GenerationUnavailable(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.config.api_key_env).map_err(|_| {
            ChatError::GenerationUnavailable(format!(
                "{} environment variable not set",
                self.config.api_key_env
            ))
        })
    }
}

#[async_trait]
impl Generator for ChatCompletionGenerator {
    async fn generate(&self, query: &str, context: &[String]) -> Result<String> {
        let api_key = self.api_key()?;

        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                { "role": "system", "content": grounding_prompt(context) },
                { "role": "user", "content": query },
            ],
        });

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::GenerationUnavailable("generation request timed out".to_string())
                } else {
                    ChatError::GenerationUnavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(ChatError::GenerationFailed(format!(
                "backend returned {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChatError::GenerationFailed(e.to_string()))?;

        parse_completion(&json)
    }
}

/// Extract the first choice's message content from a chat-completions
/// response body.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ChatError::GenerationFailed("response missing choices[0].message.content".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grounding_prompt_embeds_all_passages() {
        let context = vec![
            "cats are mammals".to_string(),
            "dogs are mammals".to_string(),
        ];
        let prompt = grounding_prompt(&context);
        assert!(prompt.contains("[passage 1]\ncats are mammals"));
        assert!(prompt.contains("[passage 2]\ndogs are mammals"));
        assert!(prompt.contains("Answer only from the provided context"));
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Cats and dogs are mammals." } }
            ]
        });
        assert_eq!(
            parse_completion(&json).unwrap(),
            "Cats and dogs are mammals."
        );
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(
            parse_completion(&json),
            Err(ChatError::GenerationFailed(_))
        ));
    }

    #[test]
    fn test_missing_api_key_is_unavailable() {
        let mut cfg = GenerationConfig::default();
        cfg.api_key_env = "DOCCHAT_TEST_KEY_THAT_IS_NOT_SET".to_string();
        let generator = ChatCompletionGenerator::new(cfg).unwrap();
        assert!(matches!(
            generator.api_key(),
            Err(ChatError::GenerationUnavailable(_))
        ));
    }
}
