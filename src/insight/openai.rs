use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::client::AIClient;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// OpenAI-compatible chat completions. Also serves self-hosted gateways
/// that speak the same wire format via a custom endpoint.
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAIClient {
    pub fn new(client: Client, api_key: String, model: String, endpoint: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model,
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl AIClient for OpenAIClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn destination(&self) -> String {
        format!("openai:{}", self.endpoint)
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let error_text = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("OpenAI API Error: {}", error_text));
        }
        let parsed: ChatResponse = res.json().await?;
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No completion returned from OpenAI"))?;
        Ok(choice.message.content.clone().unwrap_or_default())
    }

    async fn health(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.endpoint);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow::anyhow!("OpenAI health returned {}", res.status()));
        }
        Ok(())
    }
}
