use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::essay::{Essay, ResearchBrief};
use crate::models::job::{EssaySettings, HumanizationSettings};
use crate::services::collaborators::{CollaboratorError, EssayAi, Refinement};

const SERVICE: &str = "ai";

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
    retry_base: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, max_retries: u32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_retries,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Override the base delay between rate-limited retries.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Send one chat completion, retrying on HTTP 429 with exponential backoff.
    async fn complete(
        &self,
        system: &str,
        content: Value,
        max_tokens: u32,
        json_output: bool,
    ) -> Result<String, CollaboratorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": content },
            ],
            "max_tokens": max_tokens,
        });
        if json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                attempt += 1;
                if attempt >= self.max_retries {
                    return Err(CollaboratorError::RateLimited { attempts: attempt });
                }
                let wait = rate_limit_backoff(self.retry_base, attempt);
                tracing::warn!(attempt, wait_ms = wait.as_millis() as u64, "AI rate limited, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                return Err(CollaboratorError::Service {
                    service: SERVICE,
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                });
            }

            let chat: ChatResponse = response.json().await?;
            return chat
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| CollaboratorError::Invalid("AI response had no content".to_string()));
        }
    }

    async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: String,
        max_tokens: u32,
    ) -> Result<T, CollaboratorError> {
        let raw = self.complete(system, Value::String(prompt), max_tokens, true).await?;
        parse_json_content(&raw)
    }
}

/// `base * (2^attempt + 1)`, saturating for large attempt counts.
fn rate_limit_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32
        .checked_pow(attempt)
        .unwrap_or(u32::MAX)
        .saturating_add(1);
    base.saturating_mul(factor)
}

/// Parse model output as JSON, tolerating a surrounding markdown fence.
fn parse_json_content<T: DeserializeOwned>(raw: &str) -> Result<T, CollaboratorError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim())?)
}

/// User-supplied instructions that override default generation behaviour.
fn must_follow(settings: &EssaySettings) -> String {
    match settings.additional_prompt.as_deref().map(str::trim) {
        Some(extra) if !extra.is_empty() => {
            format!("\n\nCRITICAL - MUST FOLLOW these additional instructions:\n{extra}")
        }
        _ => String::new(),
    }
}

fn essay_json(essay: &Essay) -> Result<String, CollaboratorError> {
    let mut essay = essay.clone();
    essay.ai_feedback = None;
    Ok(serde_json::to_string(&essay)?)
}

const ESSAY_SCHEMA: &str = r#"{"title": "...", "thesis_statement": "...", "introduction": "...", "body_sections": [{"title": "...", "content": "..."}], "conclusion": "...", "references": ["..."]}"#;

#[async_trait]
impl EssayAi for OpenAiClient {
    async fn describe_image(
        &self,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<String, CollaboratorError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let content = json!([
            {
                "type": "text",
                "text": "Describe this image in detail. Focus on any data, charts, text, or key visual elements that are relevant for an academic essay."
            },
            {
                "type": "image_url",
                "image_url": { "url": format!("data:{mime_type};base64,{encoded}") }
            }
        ]);
        self.complete("You describe images for academic writers.", content, 500, false)
            .await
    }

    async fn research(
        &self,
        source_text: &str,
        settings: &EssaySettings,
    ) -> Result<ResearchBrief, CollaboratorError> {
        let prompt = format!(
            "Read the assignment below. Return JSON {{\"target_word_count\": number, \
             \"requirements\": [string], \"outline\": [section titles]}}. Use 1500 words \
             when no length is stated.{}\n\nAssignment:\n{source_text}",
            must_follow(settings)
        );
        self.complete_json("You are an academic planner. Output valid JSON only.", prompt, 2000)
            .await
    }

    async fn write(
        &self,
        source_text: &str,
        brief: &ResearchBrief,
        settings: &EssaySettings,
    ) -> Result<Essay, CollaboratorError> {
        let prompt = format!(
            "Write a {}-word academic essay answering the assignment. Requirements: {}. \
             Body sections in order: {}. Return JSON matching {ESSAY_SCHEMA}.{}\n\nAssignment:\n{source_text}",
            brief.target_word_count,
            brief.requirements.join("; "),
            brief.outline.join(" | "),
            must_follow(settings)
        );
        self.complete_json("You are an expert academic writer. Output valid JSON only.", prompt, 8000)
            .await
    }

    async fn humanize(
        &self,
        essay: &Essay,
        settings: &HumanizationSettings,
    ) -> Result<Essay, CollaboratorError> {
        let prompt = format!(
            "Rewrite this essay so it reads naturally. Intensity {:.2} (0 light, 1 aggressive). \
             Preserve citations: {}. Vary sentence length: {}. Add transitional phrases: {}. \
             Keep the same JSON structure.\n\n{}",
            settings.intensity,
            settings.preserve_citations,
            settings.vary_sentence_length,
            settings.add_transitional_phrases,
            essay_json(essay)?
        );
        self.complete_json("You are a careful editor. Output valid JSON only.", prompt, 8000)
            .await
    }

    async fn structure(&self, raw_text: &str) -> Result<Essay, CollaboratorError> {
        let excerpt: String = raw_text.chars().take(15_000).collect();
        let prompt = format!(
            "Structure the raw essay text below into JSON matching {ESSAY_SCHEMA}. \
             Preserve the original wording. Capture full reference entries; use an \
             empty list when there is no reference section.\n\nRaw Essay Text:\n{excerpt}"
        );
        self.complete_json("You are a strict JSON formatter. Output ONLY valid JSON.", prompt, 8000)
            .await
    }

    async fn refine(
        &self,
        essay: &Essay,
        instructions: &str,
    ) -> Result<Refinement, CollaboratorError> {
        let prompt = format!(
            "Refinement instructions from the user:\n\"{instructions}\"\n\n\
             Real word count (excluding references): {}.\n\n\
             If the user asks a question, answer it in 'ai_feedback' and leave the essay unchanged. \
             Otherwise apply the edits and summarise them in 'ai_feedback'. Keep the JSON \
             structure identical and add 'ai_feedback' at the root.\n\nCurrent essay:\n{}",
            essay.word_count(),
            essay_json(essay)?
        );
        let mut refined: Essay = self
            .complete_json("You are an intelligent editor. Output valid JSON only.", prompt, 8000)
            .await?;
        let feedback = refined
            .ai_feedback
            .take()
            .filter(|text| !text.trim().is_empty());
        Ok(Refinement {
            essay: refined,
            feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_content_strips_fence() {
        let raw = "```json\n{\"target_word_count\": 1200, \"outline\": [\"A\"]}\n```";
        let brief: ResearchBrief = parse_json_content(raw).unwrap();
        assert_eq!(brief.target_word_count, 1200);
        assert_eq!(brief.outline, vec!["A".to_string()]);
        assert!(brief.requirements.is_empty());
    }

    #[test]
    fn test_parse_json_content_rejects_prose() {
        let result: Result<ResearchBrief, _> = parse_json_content("Sure! Here is the plan.");
        assert!(matches!(result, Err(CollaboratorError::Parse(_))));
    }

    #[test]
    fn test_must_follow_only_when_prompt_present() {
        let mut settings = EssaySettings::default();
        assert_eq!(must_follow(&settings), "");
        settings.additional_prompt = Some("   ".to_string());
        assert_eq!(must_follow(&settings), "");
        settings.additional_prompt = Some("Use MLA citations".to_string());
        assert!(must_follow(&settings).contains("CRITICAL - MUST FOLLOW"));
        assert!(must_follow(&settings).ends_with("Use MLA citations"));
    }

    #[test]
    fn test_essay_json_drops_previous_feedback() {
        let essay = Essay {
            ai_feedback: Some("old reply".to_string()),
            ..Essay::default()
        };
        assert!(!essay_json(&essay).unwrap().contains("old reply"));
    }

    #[tokio::test]
    async fn test_refine_reports_empty_feedback_as_none() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let content = r#"{"title":"T","introduction":"I","body_sections":[],"conclusion":"C","references":[],"ai_feedback":"  "}"#;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": content } }]
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&server.uri(), "key", "gpt-4o", 3);
        let refinement = client.refine(&Essay::default(), "tighten").await.unwrap();
        assert_eq!(refinement.essay.title, "T");
        assert!(refinement.feedback.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_local_retries() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&server.uri(), "key", "gpt-4o", 3)
            .with_retry_base(Duration::from_millis(1));
        let err = client.structure("raw text").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::RateLimited { attempts: 3 }));
    }

    #[test]
    fn test_rate_limit_backoff_saturates() {
        let base = Duration::from_secs(1);
        assert_eq!(rate_limit_backoff(base, 1), Duration::from_secs(3));
        assert_eq!(rate_limit_backoff(base, 3), Duration::from_secs(9));
        assert_eq!(rate_limit_backoff(base, 40), base.saturating_mul(u32::MAX));
        assert_eq!(rate_limit_backoff(Duration::MAX, 2), Duration::MAX);
    }
}
