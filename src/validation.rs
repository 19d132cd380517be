//! Request-shape checks for the generation endpoint.
//!
//! The body is first parsed into a `serde_json::Value` so that a malformed
//! document (`INVALID_JSON`) can be told apart from a well-formed document of
//! the wrong shape (`INVALID_REQUEST`).

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{GenerationRequest, GenerationSettings, Mode};

pub const MAX_QUESTION_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("mode must be one of chat, analyze, summarize")]
    InvalidMode,
    #[error("question must be a string")]
    MissingQuestion,
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("question must be at most 10000 characters (got {0})")]
    QuestionTooLong(usize),
    #[error("context must be a string")]
    InvalidContext,
    #[error("settings must be an object")]
    InvalidSettings,
}

pub fn parse_request(value: Value) -> Result<GenerationRequest, ValidationError> {
    let Value::Object(fields) = value else {
        return Err(ValidationError::NotAnObject);
    };

    let mode = fields
        .get("mode")
        .and_then(Value::as_str)
        .and_then(|m| m.parse::<Mode>().ok())
        .ok_or(ValidationError::InvalidMode)?;

    let question = fields
        .get("question")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingQuestion)?;
    if question.trim().is_empty() {
        return Err(ValidationError::EmptyQuestion);
    }
    let len = question.chars().count();
    if len > MAX_QUESTION_CHARS {
        return Err(ValidationError::QuestionTooLong(len));
    }

    let context = match fields.get("context") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(ValidationError::InvalidContext),
    };

    // `userSettings` is the older name for the same field
    let settings = match fields.get("settings").or_else(|| fields.get("userSettings")) {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(read_settings(map)),
        Some(_) => return Err(ValidationError::InvalidSettings),
    };

    Ok(GenerationRequest {
        mode,
        question: question.to_string(),
        context,
        settings,
    })
}

// Fields of the wrong type are dropped, not rejected
fn read_settings(map: &Map<String, Value>) -> GenerationSettings {
    GenerationSettings {
        temperature: map
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|t| t as f32),
        max_tokens: map
            .get("maxTokens")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        model: map
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_minimal_request() {
        let req = parse_request(json!({ "mode": "chat", "question": "What is the weather like?" }))
            .unwrap();
        assert_eq!(req.mode, Mode::Chat);
        assert_eq!(req.question, "What is the weather like?");
        assert!(req.context.is_none());
        assert!(req.settings.is_none());
    }

    #[test]
    fn test_accepts_optional_fields() {
        let req = parse_request(json!({
            "mode": "analyze",
            "question": "Analyze this data",
            "context": "Some context information",
            "userSettings": { "temperature": 0.5, "maxTokens": 500 }
        }))
        .unwrap();

        assert_eq!(req.context.as_deref(), Some("Some context information"));
        let settings = req.settings.unwrap();
        assert_eq!(settings.temperature, Some(0.5));
        assert_eq!(settings.max_tokens, Some(500));
        assert_eq!(settings.model, None);
    }

    #[test]
    fn test_rejects_bad_mode() {
        for mode in [json!("invalid"), json!("CHAT"), json!(3), Value::Null] {
            let err = parse_request(json!({ "mode": mode, "question": "q" })).unwrap_err();
            assert_eq!(err, ValidationError::InvalidMode);
        }
        let err = parse_request(json!({ "question": "q" })).unwrap_err();
        assert_eq!(err, ValidationError::InvalidMode);
    }

    #[test]
    fn test_rejects_blank_question() {
        for question in ["", "   ", "\n\t "] {
            let err = parse_request(json!({ "mode": "chat", "question": question })).unwrap_err();
            assert_eq!(err, ValidationError::EmptyQuestion);
        }
        let err = parse_request(json!({ "mode": "chat", "question": 42 })).unwrap_err();
        assert_eq!(err, ValidationError::MissingQuestion);
    }

    #[test]
    fn test_question_length_bound() {
        let at_limit = "x".repeat(MAX_QUESTION_CHARS);
        assert!(parse_request(json!({ "mode": "chat", "question": at_limit })).is_ok());

        let over = "x".repeat(MAX_QUESTION_CHARS + 1);
        let err = parse_request(json!({ "mode": "chat", "question": over })).unwrap_err();
        assert_eq!(err, ValidationError::QuestionTooLong(MAX_QUESTION_CHARS + 1));
    }

    #[test]
    fn test_context_and_settings_shapes() {
        let err = parse_request(json!({ "mode": "chat", "question": "q", "context": 12 }))
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidContext);

        let err = parse_request(json!({ "mode": "chat", "question": "q", "settings": "hot" }))
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidSettings);

        let req = parse_request(json!({
            "mode": "summarize",
            "question": "q",
            "context": "",
            "settings": { "temperature": "warm", "maxTokens": -1, "model": "" }
        }))
        .unwrap();
        assert!(req.context.is_none());
        assert_eq!(req.settings, Some(GenerationSettings::default()));
    }

    #[test]
    fn test_rejects_non_object() {
        assert_eq!(
            parse_request(json!(["chat", "q"])).unwrap_err(),
            ValidationError::NotAnObject
        );
    }
}
