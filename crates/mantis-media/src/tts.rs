// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text-to-speech adapter.
//!
//! With a reference voice sample the request goes multipart to `/tts`
//! (voice cloning); otherwise a JSON OpenAI-compatible body goes to
//! `/v1/audio/speech`. The response body is the audio bytes.

use std::time::Duration;

use async_trait::async_trait;
use mantis_core::{MantisError, Tts, TtsRequest};
use serde_json::json;

/// HTTP TTS client.
pub struct TtsClient {
    base_url: String,
    client: reqwest::Client,
}

impl TtsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MantisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MantisError::Media {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(TtsClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn synthesize_json(&self, req: &TtsRequest) -> Result<Vec<u8>, MantisError> {
        let mut body = json!({
            "model": "cosyvoice3",
            "input": req.text,
            "voice": "default",
            "response_format": or_default(&req.format, "wav"),
        });
        if !req.instructions.is_empty() {
            body["instructions"] = json!(req.instructions);
        } else if !req.emotion.is_empty() {
            body["instructions"] = json!(req.emotion);
        }

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(request_err)?;
        read_audio(response).await
    }

    async fn synthesize_multipart(
        &self,
        req: &TtsRequest,
        voice: &[u8],
    ) -> Result<Vec<u8>, MantisError> {
        let mut form = reqwest::multipart::Form::new()
            .text("text", req.text.clone())
            .text("response_format", or_default(&req.format, "wav").to_string());
        if !req.emotion.is_empty() {
            form = form.text("emotion", req.emotion.clone());
        }
        if !req.instructions.is_empty() {
            form = form.text("instruct", req.instructions.clone());
        }
        form = form.part(
            "voice",
            reqwest::multipart::Part::bytes(voice.to_vec()).file_name("voice.wav"),
        );

        let response = self
            .client
            .post(format!("{}/tts", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(request_err)?;
        read_audio(response).await
    }
}

#[async_trait]
impl Tts for TtsClient {
    async fn synthesize(&self, req: TtsRequest) -> Result<Vec<u8>, MantisError> {
        match &req.voice {
            Some(voice) if !voice.is_empty() => {
                let voice = voice.clone();
                self.synthesize_multipart(&req, &voice).await
            }
            _ => self.synthesize_json(&req).await,
        }
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn request_err(err: reqwest::Error) -> MantisError {
    MantisError::Media {
        message: format!("TTS request failed: {err}"),
        source: Some(Box::new(err)),
    }
}

async fn read_audio(response: reqwest::Response) -> Result<Vec<u8>, MantisError> {
    let status = response.status();
    let body = response.bytes().await.map_err(request_err)?;
    if !status.is_success() {
        return Err(MantisError::media(format!(
            "TTS API error {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }
    Ok(body.to_vec())
}
