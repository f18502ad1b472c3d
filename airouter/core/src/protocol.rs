//! OpenAI-compatible wire types
//!
//! Only the fields the router inspects are typed; everything else a client
//! sends is kept in `extra` and forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Model names that mean "let the router choose"
const AUTO_MODELS: &[&str] = &["", "auto", "default"];

/// Headers owned by the memory subsystem, forwarded to the upstream as-is
pub const PASSTHROUGH_HEADERS: &[&str] = &[
    "x-enable-memory",
    "x-user-id",
    "x-project",
    "x-conversation-id",
];

/// Body of `POST /v1/chat/completions`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model, optionally prefixed with `<provider>/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Conversation so far
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Completion length limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Server-sent events instead of a single JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Any other OpenAI parameters (tools, stop, seed, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    /// Whether the client asked for a streamed response
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Requested model, with the "auto" spellings folded to `None`
    #[must_use]
    pub fn requested_model(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !AUTO_MODELS.contains(&m.to_ascii_lowercase().as_str()))
    }

    /// Reject bodies that cannot be forwarded
    ///
    /// # Errors
    ///
    /// Returns a human readable reason.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("'messages' must contain at least one message".to_string());
        }
        if let Some(i) = self.messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(format!("'messages[{i}].role' must not be empty"));
        }
        Ok(())
    }

    /// Copy of this request addressed to a concrete upstream model
    #[must_use]
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: Some(model.to_string()),
            ..self.clone()
        }
    }
}

/// A single chat message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", "assistant" or "tool"
    pub role: String,

    /// String or array of content parts
    #[serde(default)]
    pub content: Value,

    /// Fields such as `name` or `tool_calls`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token accounting reported by the upstream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Generated tokens
    #[serde(default)]
    pub completion_tokens: u64,
    /// Sum of both
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Extract `usage` from an OpenAI response body
    #[must_use]
    pub fn from_body(body: &Value) -> Option<Self> {
        body.get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
    }
}

/// Format one SSE frame
#[must_use]
pub fn sse_frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// Terminal SSE frame
pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive() {
        let body = json!({
            "model": "gpu/llama3",
            "messages": [{"role": "user", "content": "hi", "name": "bob"}],
            "stream": true,
            "tools": [{"type": "function"}],
            "seed": 7
        });

        let request: ChatCompletionRequest = serde_json::from_value(body.clone()).unwrap();
        assert!(request.is_stream());
        assert_eq!(request.extra.get("seed"), Some(&json!(7)));
        assert_eq!(request.messages[0].extra.get("name"), Some(&json!("bob")));

        let forwarded = serde_json::to_value(request.for_model("llama3")).unwrap();
        assert_eq!(forwarded["model"], json!("llama3"));
        assert_eq!(forwarded["tools"], body["tools"]);
    }

    #[test]
    fn test_requested_model_auto() {
        let mut request = ChatCompletionRequest::default();
        assert_eq!(request.requested_model(), None);

        request.model = Some("Auto".to_string());
        assert_eq!(request.requested_model(), None);

        request.model = Some("qwen2.5-coder:14b".to_string());
        assert_eq!(request.requested_model(), Some("qwen2.5-coder:14b"));
    }

    #[test]
    fn test_validate() {
        let empty = ChatCompletionRequest::default();
        assert!(empty.validate().is_err());

        let request = ChatCompletionRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: json!("hello"),
                extra: Map::new(),
            }],
            ..Default::default()
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_usage_from_body() {
        let body = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}});
        assert_eq!(
            Usage::from_body(&body),
            Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 5,
                total_tokens: 8
            })
        );
        assert_eq!(Usage::from_body(&json!({})), None);
    }
}
