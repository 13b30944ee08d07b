// src/providers/openai.rs
// OpenAI provider - EMBEDDINGS ONLY

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::EmbeddingProvider;
use crate::error::{GatewayError, GatewayResult};

pub struct OpenAiEmbeddings {
    client: Client,
    api_key: String,
    model: String,
    dim: usize,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, model: String, dim: usize, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            model,
            dim,
        }
    }

    fn check_dim(&self, embedding: Vec<f32>) -> GatewayResult<Vec<f32>> {
        if embedding.len() != self.dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dim,
                got: embedding.len(),
            });
        }
        Ok(embedding)
    }

    async fn request(&self, input: Value) -> GatewayResult<Value> {
        let body = json!({
            "model": self.model,
            "input": input,
            "dimensions": self.dim,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("embedding request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(format!(
                "OpenAI API error {}: {}",
                status, error_text
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::upstream(format!("embedding response: {}", e)))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    /// Generate embedding for text
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>> {
        let raw = self.request(json!(text)).await?;

        let embedding: Vec<f32> = raw["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| GatewayError::upstream("no embedding in OpenAI response"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        self.check_dim(embedding)
    }

    /// Generate embeddings for multiple texts in a single API call
    async fn embed_batch(&self, texts: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let raw = self.request(json!(texts)).await?;

        let data_array = raw["data"]
            .as_array()
            .ok_or_else(|| GatewayError::upstream("no data array in OpenAI response"))?;

        let mut embeddings = Vec::with_capacity(data_array.len());
        for item in data_array {
            let embedding: Vec<f32> = item["embedding"]
                .as_array()
                .ok_or_else(|| GatewayError::upstream("malformed embedding in batch response"))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(self.check_dim(embedding)?);
        }

        Ok(embeddings)
    }
}
