use crate::config::LLMConfig;
use crate::prompt::PromptBuilder;
use crate::{RescrapeError, SummarizationError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// The external summarization call: article text in, summary out.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, text: &str, prompt_template: &str) -> Result<String, SummarizationError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// The `LLMProcessor` struct sends prompts to an Ollama-compatible `/api/generate` endpoint.
pub struct LLMProcessor {
    client: Client,
    config: LLMConfig,
}

impl LLMProcessor {
    pub fn new(config: LLMConfig) -> Result<Self, RescrapeError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(RescrapeError::ClientError)?;

        Ok(Self { client, config })
    }

    /// Sends one prompt and returns the model's raw answer.
    #[instrument(skip(self, prompt), fields(prompt_length = prompt.len(), model = %self.config.model))]
    pub async fn process(&self, prompt: &str) -> Result<String, SummarizationError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let response = self.client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        debug!("LLM response status: {}", status);

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SummarizationError::QuotaExceeded);
        }
        if !status.is_success() {
            return Err(SummarizationError::InvalidResponse(format!("status {}", status)));
        }

        let body: GenerateResponse = response.json().await.map_err(map_transport_error)?;
        Ok(body.response.trim().to_string())
    }
}

fn map_transport_error(e: reqwest::Error) -> SummarizationError {
    if e.is_timeout() {
        SummarizationError::Timeout
    } else {
        SummarizationError::InvalidResponse(e.to_string())
    }
}

#[async_trait]
impl Summarize for LLMProcessor {
    async fn summarize(&self, text: &str, prompt_template: &str) -> Result<String, SummarizationError> {
        let prompt = PromptBuilder::new(prompt_template).with_content(text).build();
        self.process(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn processor(endpoint: String) -> LLMProcessor {
        LLMProcessor::new(LLMConfig {
            endpoint,
            timeout_seconds: 5,
            ..LLMConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_summarize_sends_filled_template() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "llama3.2:latest",
                "prompt": "Summarize: Title: X",
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":"  A summary.  ","done":true}"#)
            .create_async()
            .await;

        let summary = processor(format!("{}/api/generate", server.url()))
            .summarize("Title:   X", "Summarize: {content}")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(summary, "A summary.");
    }

    #[tokio::test]
    async fn test_quota_and_bad_responses() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/quota").with_status(429).create_async().await;
        server
            .mock("POST", "/garbage")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let quota = processor(format!("{}/quota", server.url())).summarize("x", "{content}").await;
        assert_eq!(quota, Err(SummarizationError::QuotaExceeded));

        let garbage = processor(format!("{}/garbage", server.url())).summarize("x", "{content}").await;
        assert!(matches!(garbage, Err(SummarizationError::InvalidResponse(_))));
    }
}
