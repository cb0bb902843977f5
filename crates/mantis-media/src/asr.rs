// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Speech-to-text adapter.
//!
//! `POST /transcribe` with the audio as a multipart `file` field. The service
//! answers either with plain JSON `{"text": ...}` or with an SSE stream whose
//! events are aggregated until `status == "completed"`.

use std::time::Duration;

use async_trait::async_trait;
use mantis_core::{Asr, MantisError};
use serde::Deserialize;

/// HTTP ASR client.
pub struct AsrClient {
    base_url: String,
    client: reqwest::Client,
}

impl AsrClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MantisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MantisError::Media {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(AsrClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Deserialize, Default)]
struct TranscribeEvent {
    #[serde(default)]
    text: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: String,
}

fn parse_sse(body: &str) -> Result<String, MantisError> {
    let mut parts = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        let Some(raw) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<TranscribeEvent>(raw.trim()) else {
            continue;
        };
        if !event.error.is_empty() {
            return Err(MantisError::media(format!("ASR: {}", event.error)));
        }
        if !event.text.is_empty() {
            parts.push(event.text);
        }
        if event.status == "completed" {
            break;
        }
    }
    if parts.is_empty() {
        return Err(MantisError::media("ASR returned no transcription"));
    }
    Ok(parts.join(" "))
}

#[async_trait]
impl Asr for AsrClient {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, MantisError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("audio.{format}"));
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| MantisError::Media {
                message: format!("ASR request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(MantisError::media(format!("ASR API error {status}: {body}")));
        }

        if content_type.contains("text/event-stream") {
            return parse_sse(&body);
        }

        #[derive(Deserialize)]
        struct Out {
            #[serde(default)]
            text: String,
        }
        let out: Out = serde_json::from_str(&body)
            .map_err(|e| MantisError::media(format!("ASR: invalid response: {e}")))?;
        Ok(out.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn plain_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "hello"})),
            )
            .mount(&server)
            .await;

        let client = AsrClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.transcribe(b"audio", "ogg").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn sse_response_is_aggregated() {
        let body = concat!(
            "data: {\"text\":\"hello\",\"status\":\"partial\"}\n\n",
            "data: {\"text\":\"world\",\"status\":\"completed\"}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = AsrClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.transcribe(b"audio", "ogg").await.unwrap(),
            "hello world"
        );
    }

    #[tokio::test]
    async fn sse_error_event_fails() {
        let body = "data: {\"error\":\"bad audio\"}\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = AsrClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.transcribe(b"audio", "ogg").await.unwrap_err();
        assert!(err.to_string().contains("bad audio"));
    }
}
