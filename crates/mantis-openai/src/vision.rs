// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image description via OpenAI-compatible chat completions.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use mantis_core::{MantisError, VisionLlm};
use serde::Deserialize;
use serde_json::json;

/// Non-streaming vision client: sends one user message carrying a text prompt
/// plus a base64 data-URL image.
#[derive(Debug, Clone)]
pub struct VisionClient {
    client: reqwest::Client,
}

impl VisionClient {
    pub fn new() -> Result<Self, MantisError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| MantisError::Media {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(VisionClient { client })
    }
}

#[derive(Deserialize)]
struct RespMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct RespChoice {
    message: RespMessage,
}

#[derive(Deserialize)]
struct VisionResponse {
    #[serde(default)]
    choices: Vec<RespChoice>,
}

#[async_trait]
impl VisionLlm for VisionClient {
    async fn describe(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        image: &[u8],
        format: &str,
        prompt: &str,
    ) -> Result<String, MantisError> {
        let mime = if format == "jpg" {
            "image/jpeg".to_string()
        } else {
            format!("image/{format}")
        };
        let data_url = format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );

        let payload = json!({
            "model": model,
            "max_tokens": 1024,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
        });

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MantisError::Media {
                message: format!("vision request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(MantisError::media(format!(
                "vision API error {status}: {body}"
            )));
        }

        let parsed: VisionResponse = serde_json::from_str(&body)
            .map_err(|e| MantisError::media(format!("vision: invalid response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MantisError::media("no response from vision model"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn describe_returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "a cat on a keyboard"}}]
            })))
            .mount(&server)
            .await;

        let client = VisionClient::new().unwrap();
        let text = client
            .describe(&server.uri(), "key", "vision-model", b"bytes", "png", "describe")
            .await
            .unwrap();
        assert_eq!(text, "a cat on a keyboard");
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = VisionClient::new().unwrap();
        let err = client
            .describe(&server.uri(), "key", "m", b"x", "jpg", "p")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no response"));
    }
}
