use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;

use crate::models::essay::Essay;
use crate::models::job::{DocumentFormat, EssaySettings};
use crate::services::collaborators::{CollaboratorError, DocumentRenderer};

const SERVICE: &str = "renderer";

/// Client for the document-rendering service.
pub struct RendererClient {
    http: Client,
    base_url: String,
}

/// Header block printed above the essay title.
#[derive(Debug, Serialize, PartialEq)]
struct RenderHeader<'a> {
    student_name: &'a str,
    course_name: &'a str,
    date: String,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    format: DocumentFormat,
    header: RenderHeader<'a>,
    essay: &'a Essay,
}

fn header(settings: &EssaySettings) -> RenderHeader<'_> {
    RenderHeader {
        student_name: settings.student_name.as_deref().unwrap_or("Student Name"),
        course_name: settings.course_name.as_deref().unwrap_or("Course Name"),
        date: Utc::now().format("%B %d, %Y").to_string(),
    }
}

impl RendererClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for RendererClient {
    async fn render(
        &self,
        essay: &Essay,
        settings: &EssaySettings,
        format: DocumentFormat,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let request = RenderRequest {
            format,
            header: header(settings),
            essay,
        };

        let response = self
            .http
            .post(format!("{}/render", self.base_url))
            .json(&request)
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

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(CollaboratorError::Invalid(format!(
                "Renderer returned an empty {format} document"
            )));
        }
        Ok(bytes.to_vec())
    }
}
