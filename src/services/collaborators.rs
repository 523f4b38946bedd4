//! Interfaces to the external systems the pipeline depends on.
//!
//! Each call is one synchronous operation from the caller's point of view;
//! any failure comes back as a [`CollaboratorError`] and is retried or
//! escalated by the dispatcher.

use async_trait::async_trait;

use crate::models::essay::{Essay, ResearchBrief};
use crate::models::job::{DocumentFormat, EssaySettings, HumanizationSettings};

/// Turns an uploaded document into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(
        &self,
        filename: &str,
        format: DocumentFormat,
        bytes: &[u8],
    ) -> Result<String, CollaboratorError>;
}

/// Result of a refine call: the updated essay plus the AI's reply to the
/// user's instruction. An empty reply is returned as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub essay: Essay,
    pub feedback: Option<String>,
}

/// AI generation, humanization and refinement service.
#[async_trait]
pub trait EssayAi: Send + Sync {
    /// Describe a reference image for inclusion in the source material.
    async fn describe_image(&self, mime_type: &str, bytes: &[u8])
        -> Result<String, CollaboratorError>;

    async fn research(
        &self,
        source_text: &str,
        settings: &EssaySettings,
    ) -> Result<ResearchBrief, CollaboratorError>;

    async fn write(
        &self,
        source_text: &str,
        brief: &ResearchBrief,
        settings: &EssaySettings,
    ) -> Result<Essay, CollaboratorError>;

    async fn humanize(
        &self,
        essay: &Essay,
        settings: &HumanizationSettings,
    ) -> Result<Essay, CollaboratorError>;

    /// Split raw essay text into the structured essay shape.
    async fn structure(&self, raw_text: &str) -> Result<Essay, CollaboratorError>;

    async fn refine(
        &self,
        essay: &Essay,
        instructions: &str,
    ) -> Result<Refinement, CollaboratorError>;
}

/// Renders an essay snapshot into a binary document.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        essay: &Essay,
        settings: &EssaySettings,
        format: DocumentFormat,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse service response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("{service} returned {status}: {body}")]
    Service {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{0}")]
    Invalid(String),
}
