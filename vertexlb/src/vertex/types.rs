//! Wire types for the Vertex AI generative-content protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `generateContent` / `streamGenerateContent` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(
        rename = "generationConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub generation_config: Option<GenerationConfig>,
}

/// One conversational turn: a role plus its parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: &str, parts: Vec<Part>) -> Self {
        Self {
            role: role.to_string(),
            parts,
        }
    }

    /// Concatenated text of all text parts, in order.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_function_call(&self) -> bool {
        self.parts.iter().any(|part| matches!(part, Part::FunctionCall { .. }))
    }

    pub fn has_function_response(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Part::FunctionResponse { .. }))
    }
}

/// A single part of a content block. The Vertex wire format distinguishes the
/// variants purely by which field is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64 payload, passed through untouched.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(
        rename = "maxOutputTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl GenerationConfig {
    pub fn is_empty(&self) -> bool {
        self.max_output_tokens.is_none() && self.temperature.is_none() && self.top_p.is_none()
    }
}

/// Response body for both the unary call and each streamed chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(
        rename = "usageMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    pub fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.as_deref().and_then(|candidates| candidates.first())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(
        rename = "finishReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other,
    FinishReasonUnspecified,
    /// Forward compatibility with reasons this proxy does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<i64>,
    #[serde(default)]
    pub candidates_token_count: Option<i64>,
    #[serde(default)]
    pub total_token_count: Option<i64>,
}

/// Error body the Vertex API returns alongside non-2xx statuses
/// (`google.rpc.Status` rendered as JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorBody {
    pub error: GoogleErrorStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorStatus {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub details: Option<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_serialize_by_field_presence() {
        let parts = vec![
            Part::Text { text: "hello".to_string() },
            Part::InlineData {
                inline_data: Blob {
                    mime_type: "image/png".to_string(),
                    data: "AAA=".to_string(),
                },
            },
            Part::FunctionCall {
                function_call: FunctionCall {
                    name: "get_weather".to_string(),
                    args: Some(json!({"city": "Paris"})),
                },
            },
        ];

        let value = serde_json::to_value(&parts).unwrap();
        assert_eq!(value[0], json!({"text": "hello"}));
        assert_eq!(value[1], json!({"inlineData": {"mimeType": "image/png", "data": "AAA="}}));
        assert_eq!(
            value[2],
            json!({"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}})
        );
    }

    #[test]
    fn response_parses_vertex_payload() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "ok"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
        });

        let response: GenerateContentResponse = serde_json::from_value(body).unwrap();
        let candidate = response.first_candidate().unwrap();
        assert_eq!(candidate.finish_reason, Some(FinishReason::Stop));
        assert_eq!(candidate.content.as_ref().unwrap().joined_text(), "ok");
        assert_eq!(response.usage_metadata.as_ref().unwrap().total_token_count, Some(4));
    }

    #[test]
    fn unknown_finish_reason_does_not_fail_parsing() {
        let body = json!({"candidates": [{"finishReason": "BLOCKLIST"}]});
        let response: GenerateContentResponse = serde_json::from_value(body).unwrap();
        assert_eq!(
            response.first_candidate().unwrap().finish_reason,
            Some(FinishReason::Unknown)
        );
    }

    #[test]
    fn function_call_part_parses_without_args() {
        let part: Part = serde_json::from_value(json!({"functionCall": {"name": "noop"}})).unwrap();
        match part {
            Part::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "noop");
                assert!(function_call.args.is_none());
            }
            other => panic!("expected functionCall, got {other:?}"),
        }
    }
}
