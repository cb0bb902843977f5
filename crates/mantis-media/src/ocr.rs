// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OCR adapter: multipart `POST /ocr` returning `{"text": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use mantis_core::{MantisError, Ocr};
use serde::Deserialize;

/// HTTP OCR client.
pub struct OcrClient {
    base_url: String,
    client: reqwest::Client,
}

impl OcrClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MantisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MantisError::Media {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(OcrClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Ocr for OcrClient {
    async fn extract_text(&self, image: &[u8], format: &str) -> Result<String, MantisError> {
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(format!("image.{format}"));
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| MantisError::Media {
                message: format!("OCR request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(MantisError::media(format!("OCR API error {status}: {body}")));
        }

        #[derive(Deserialize)]
        struct Out {
            #[serde(default)]
            text: String,
        }
        let out: Out = serde_json::from_str(&body)
            .map_err(|e| MantisError::media(format!("OCR: invalid response: {e}")))?;
        Ok(out.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn extracts_text_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "receipt total 12.50"})),
            )
            .mount(&server)
            .await;

        let client = OcrClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.extract_text(b"img", "png").await.unwrap(),
            "receipt total 12.50"
        );
    }
}
