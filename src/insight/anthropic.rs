use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::client::AIClient;

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl AnthropicClient {
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

    async fn send(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let url = format!("{}/v1/messages", self.endpoint);
        let res = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&AnthropicRequest {
                model: &self.model,
                max_tokens,
                messages: vec![AnthropicMessage {
                    role: "user",
                    content: prompt,
                }],
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let error_text = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Anthropic API Error: {}", error_text));
        }
        let parsed: AnthropicResponse = res.json().await?;
        let text = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}

#[async_trait]
impl AIClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn destination(&self) -> String {
        format!("anthropic:{}", self.endpoint)
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        self.send(prompt, 1024).await
    }

    async fn health(&self) -> anyhow::Result<()> {
        // No dedicated health endpoint; a one-token round-trip proves auth
        // and reachability.
        self.send("ping", 1).await.map(|_| ())
    }
}
