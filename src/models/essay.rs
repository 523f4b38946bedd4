use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One titled section of the essay body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodySection {
    pub title: String,
    pub content: String,
}

/// The working essay artifact carried by every job.
///
/// Empty until the writer (create flow) or the extractor (import flow) fills
/// it in. Stages replace it wholesale, never append to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Essay {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thesis_statement: Option<String>,
    pub introduction: String,
    #[serde(default)]
    pub body_sections: Vec<BodySection>,
    pub conclusion: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_level: Option<String>,
    /// Latest response from the refine AI to the user's last instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_feedback: Option<String>,
}

impl Essay {
    /// Word count of introduction, body and conclusion. References are excluded.
    pub fn word_count(&self) -> usize {
        let body: usize = self
            .body_sections
            .iter()
            .map(|s| s.content.split_whitespace().count())
            .sum();
        self.introduction.split_whitespace().count()
            + body
            + self.conclusion.split_whitespace().count()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.introduction.is_empty()
            && self.body_sections.is_empty()
            && self.conclusion.is_empty()
    }
}

/// Output of the research stage, consumed by the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchBrief {
    pub target_word_count: u32,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Planned body section titles, in order.
    #[serde(default)]
    pub outline: Vec<String>,
}

/// Audit record of one applied refinement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementEntry {
    pub instructions: String,
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Essay {
        Essay {
            title: "Urban Heat Islands".to_string(),
            thesis_statement: None,
            introduction: "Cities are warmer than their surroundings.".to_string(),
            body_sections: vec![
                BodySection {
                    title: "Causes".to_string(),
                    content: "Asphalt absorbs heat".to_string(),
                },
                BodySection {
                    title: "Effects".to_string(),
                    content: "Energy demand rises".to_string(),
                },
            ],
            conclusion: "Planting trees helps.".to_string(),
            references: vec!["Oke, T. R. (1982). The energetic basis of the urban heat island.".to_string()],
            academic_level: Some("undergraduate".to_string()),
            ai_feedback: None,
        }
    }

    #[test]
    fn test_word_count_excludes_references() {
        // 6 + 3 + 3 + 3
        assert_eq!(sample().word_count(), 15);
    }

    #[test]
    fn test_default_essay_is_empty() {
        assert!(Essay::default().is_empty());
        assert!(!sample().is_empty());
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let json = r#"{
            "title": "T",
            "introduction": "I",
            "body_sections": [{"title": "S", "content": "C"}],
            "conclusion": "C"
        }"#;
        let essay: Essay = serde_json::from_str(json).unwrap();
        assert!(essay.references.is_empty());
        assert!(essay.ai_feedback.is_none());
        assert_eq!(essay.body_sections.len(), 1);
    }
}
