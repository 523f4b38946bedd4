use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;

use crate::models::job::DocumentFormat;
use crate::services::collaborators::{CollaboratorError, TextExtractor};

const SERVICE: &str = "extraction";

/// Client for the document text-extraction service.
///
/// Posts the file as multipart form data to `{base_url}/extract` and expects
/// `{"text": "..."}` back.
pub struct ExtractionClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ExtractResponse {
    text: String,
}

impl ExtractionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TextExtractor for ExtractionClient {
    async fn extract_text(
        &self,
        filename: &str,
        format: DocumentFormat,
        bytes: &[u8],
    ) -> Result<String, CollaboratorError> {
        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(format.content_type())?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("file_type", format.to_string());

        let response = self
            .http
            .post(format!("{}/extract", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Service {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let extracted: ExtractResponse = response.json().await?;
        if extracted.text.trim().is_empty() {
            return Err(CollaboratorError::Invalid(format!(
                "No text could be extracted from {filename}"
            )));
        }
        Ok(extracted.text)
    }
}
