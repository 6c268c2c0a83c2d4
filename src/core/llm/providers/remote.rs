//! Remote chat backend (Ollama wire).
//!
//! Wire contract: POST `<base_url>/api/chat` with
//! `{"model", "messages", "stream", "options": {"temperature", "num_predict"}}`.
//! Streaming responses are line-delimited JSON of
//! `{"message": {"content": "..."}, "done": bool}`; lines may be split
//! across transport chunks, so parsing goes through a line buffer.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::super::{
    generation_timeout_secs, timeout_message, ChatBackend, ChatMessage, LlmError, LlmModelInfo,
    Result,
};

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

pub struct RemoteLlmBackend {
    base_url: String,
    client: Client,
}

impl RemoteLlmBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn request_body(
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> serde_json::Value {
        let mut options = json!({ "temperature": temperature });
        if let Some(n) = max_tokens {
            options["num_predict"] = json!(n);
        }
        json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }

    /// Parse complete NDJSON lines out of `buffer`, pushing content
    /// fragments into `out`. Returns true once a `"done": true` line was
    /// seen.
    fn drain_lines(buffer: &mut String, out: &mut Vec<String>) -> bool {
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.replace_range(..=newline, "");

            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                tracing::warn!("skipping malformed stream line");
                continue;
            };

            if let Some(content) = value["message"]["content"].as_str() {
                if !content.is_empty() {
                    out.push(content.to_string());
                }
            }
            if value["done"].as_bool().unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl ChatBackend for RemoteLlmBackend {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::request_body(model, messages, false, temperature, max_tokens);
        let deadline = Duration::from_secs(generation_timeout_secs(max_tokens));

        let resp = match self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                tracing::warn!(model, "generation deadline hit");
                return Ok(timeout_message());
            }
            Err(e) => return Err(e.into()),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let value: serde_json::Value = resp.json().await?;
        let content = value["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("response missing message content".into()))?;
        if content.is_empty() {
            return Err(LlmError::InvalidResponse("empty completion".into()));
        }
        Ok(content.to_string())
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::request_body(model, messages, true, temperature, max_tokens);
        let deadline = Duration::from_secs(generation_timeout_secs(max_tokens));

        let response = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut fragments = Vec::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        let done = Self::drain_lines(&mut buffer, &mut fragments);
                        for fragment in fragments.drain(..) {
                            if tx.send(Ok(fragment)).await.is_err() {
                                // Consumer hung up; abandon the stream.
                                return;
                            }
                        }
                        if done {
                            return;
                        }
                    }
                    Err(e) if e.is_timeout() => {
                        tracing::warn!("generation deadline hit mid-stream");
                        let _ = tx.send(Ok(timeout_message())).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Network(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<LlmModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LlmError::Api {
                status: resp.status().as_u16(),
                message: "model listing failed".into(),
            });
        }

        let tags: TagsResponse = resp.json().await?;
        Ok(tags
            .models
            .into_iter()
            .filter(|m| !m.name.to_lowercase().contains("embed"))
            .map(|m| LlmModelInfo {
                name: m.name,
                provider: "remote".to_string(),
                size_bytes: m.size,
            })
            .collect())
    }

    async fn unload(&self) {
        // The remote host owns its model memory.
    }
}
