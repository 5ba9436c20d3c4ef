//! LLM-backed subject extraction. Any failure yields no subjects.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Classification, InboundMessage, IngestionClassifier};
use crate::llm_client::{LlmClient, Message};

const SYSTEM_PROMPT: &str =
    "You extract university course names from chat messages and return ONLY valid JSON.";

#[derive(Debug, Deserialize)]
struct SubjectsResponse {
    #[serde(default)]
    subjects: Vec<serde_json::Value>,
}

pub struct SubjectExtractor {
    llm: LlmClient,
}

impl SubjectExtractor {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    fn prompt(text: &str) -> String {
        format!(
            "The message below was posted by a student in a university chat. It may \
             name courses in Arabic or English.\n\
             1) Extract course names only.\n\
             2) Ignore words such as exam, doctor, lecture, section.\n\
             3) Reply with JSON only: {{\"subjects\": [\"course 1\", \"course 2\"]}}\n\
             If there are none: {{\"subjects\": []}}\n\n\
             Message:\n\"\"\"\n{}\n\"\"\"",
            text
        )
    }

    pub async fn extract(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let messages = vec![Message::system(SYSTEM_PROMPT), Message::user(Self::prompt(text))];
        match self.llm.generate_json::<SubjectsResponse>(messages).await {
            Ok(resp) => clean_subjects(resp.subjects),
            Err(e) => {
                tracing::warn!("[SUBJECTS] extraction failed, continuing without: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Keep non-empty strings, first occurrence only.
fn clean_subjects(values: Vec<serde_json::Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            if !out.iter().any(|o| o == s) {
                out.push(s.to_string());
            }
        }
    }
    out
}

#[async_trait]
impl IngestionClassifier for SubjectExtractor {
    async fn classify(&self, msg: &InboundMessage) -> Classification {
        Classification {
            tags: self.extract(&msg.text).await,
            recipient: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_backend_yields_nothing() {
        let llm = LlmClient::new(
            "http://127.0.0.1:9".to_string(),
            String::new(),
            "test-model".to_string(),
        );
        let extractor = SubjectExtractor::new(llm);
        assert!(extractor.extract("Need help in Calculus").await.is_empty());
        assert!(extractor.extract("   ").await.is_empty());
    }

    #[test]
    fn non_string_subjects_are_discarded() {
        let resp: SubjectsResponse =
            serde_json::from_str(r#"{"subjects": ["Physics", 3, null, " ", "Physics "]}"#).unwrap();
        assert_eq!(clean_subjects(resp.subjects), vec!["Physics"]);

        let missing: SubjectsResponse = serde_json::from_str("{}").unwrap();
        assert!(clean_subjects(missing.subjects).is_empty());
    }
}
