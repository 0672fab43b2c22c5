use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::client::AIClient;

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Local-model provider. Needs no credential; the endpoint comes from the
/// user's config or `OLLAMA_ENDPOINT`.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    pub fn new(client: Client, endpoint: String, model: String) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl AIClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn destination(&self) -> String {
        format!("ollama:{}", self.endpoint)
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let res = self
            .client
            .post(&url)
            .json(&OllamaRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let error_text = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Ollama API Error: {}", error_text));
        }
        let parsed: OllamaResponse = res.json().await?;
        Ok(parsed.response)
    }

    async fn health(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/tags", self.endpoint);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(anyhow::anyhow!("Ollama health returned {}", res.status()));
        }
        Ok(())
    }
}
