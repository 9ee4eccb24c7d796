//! Wire types for the chat stream endpoint

use serde::{Deserialize, Serialize};

use crate::completions::TokenUsage;
use crate::error::ApiError;
use crate::evidence::Citation;
use crate::research::ResearchProgress;

/// Attachments allowed on one request
pub const MAX_FILE_IDS: usize = 5;

/// Events sent to the client over SSE.
///
/// `metadata` is always first and exactly one `done` is always last;
/// `token`/`reasoning` only appear in between.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Metadata {
        grounding: bool,
        deep_research: bool,
        model_id: String,
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning_effort: Option<String>,
    },

    Progress {
        #[serde(flatten)]
        progress: ResearchProgress,
    },

    Warning { scope: String, message: String },

    Token { delta: String },

    Reasoning { delta: String },

    Citations { citations: Vec<Citation> },

    Usage {
        #[serde(flatten)]
        usage: TokenUsage,
    },

    Error { message: String },

    Done,
}

/// Chat request body. Unknown fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub grounding: Option<bool>,
    #[serde(default)]
    pub deep_research: Option<bool>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.message.trim().is_empty() {
            return Err(ApiError::invalid_request("message must not be empty"));
        }
        if self.file_ids.len() > MAX_FILE_IDS {
            return Err(ApiError::invalid_request(format!(
                "at most {MAX_FILE_IDS} attachments per message"
            )));
        }
        if let Some(effort) = &self.reasoning_effort {
            if !crate::context::valid_effort(effort) {
                return Err(ApiError::invalid_request(
                    "reasoningEffort must be one of low, medium, high",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_rejected() {
        let body = r#"{"message":"hi","bogus":true}"#;
        assert!(serde_json::from_str::<ChatRequest>(body).is_err());
    }

    #[test]
    fn test_validate_blank_message() {
        let request: ChatRequest = serde_json::from_str(r#"{"message":"   "}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_bad_effort() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message":"hi","reasoningEffort":"max"}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_too_many_files() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"message":"hi","fileIds":["1","2","3","4","5","6"]}"#,
        )
        .unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_event_tags() {
        let event = StreamEvent::Metadata {
            grounding: true,
            deep_research: false,
            model_id: "m/free".into(),
            conversation_id: "c1".into(),
            reasoning_effort: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["modelId"], "m/free");
        assert_eq!(json["conversationId"], "c1");

        let done = serde_json::to_value(StreamEvent::Done).unwrap();
        assert_eq!(done["type"], "done");

        let token = serde_json::to_value(StreamEvent::Token { delta: "x".into() }).unwrap();
        assert_eq!(token["type"], "token");
        assert_eq!(token["delta"], "x");
    }
}
