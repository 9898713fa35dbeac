use async_trait::async_trait;
use base64::Engine as _;

use crate::errors::{WaypostError, WaypostResult};
use crate::llm::provider::VisionProvider;
use crate::llm::types::{CallConfig, ChatMessage, ContentPart, ImageUrl, MessageContent};

pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String) -> Self {
        Self {
            id,
            api_base,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VisionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn analyze(
        &self,
        frames: &[Vec<u8>],
        prompt: &str,
        system: Option<&str>,
        cfg: &CallConfig,
    ) -> WaypostResult<String> {
        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::text("system", sys));
        }

        if frames.is_empty() {
            messages.push(ChatMessage::text("user", prompt));
        } else {
            let mut parts: Vec<ContentPart> = frames
                .iter()
                .map(|bytes| {
                    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/png;base64,{b64}"),
                        },
                    }
                })
                .collect();
            parts.push(ContentPart::Text {
                text: prompt.to_string(),
            });
            messages.push(ChatMessage {
                role: "user".into(),
                content: MessageContent::Parts(parts),
            });
        }

        let body = serde_json::json!({
            "model": cfg.model,
            "messages": &messages,
            "stream": false,
            "temperature": cfg.temperature,
        });

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            frames = frames.len(),
            prompt_len = prompt.len(),
            "sending model request"
        );

        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(WaypostError::LlmProvider(format!("{status}: {err_body}")));
        }

        let json: serde_json::Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        tracing::info!(
            provider = %self.id,
            content_len = content.len(),
            "model response received"
        );

        Ok(content)
    }
}
