//! The tool-call envelope: the JSON object an adapter returns instead of prose
//! when the model asks to run tools.
//!
//! ```json
//! {"tool_calls":[{"id":"c1","function":{"name":"search_internet","arguments":"{\"query\":\"weather\"}"}}]}
//! ```

use crate::domain::models::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key whose presence marks a response as a tool-call envelope.
pub const ENVELOPE_MARKER: &str = "tool_calls";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallEnvelope {
    pub tool_calls: Vec<EnvelopeCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: EnvelopeFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeFunction {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded string on the wire; some providers send an object instead.
    #[serde(default)]
    pub arguments: Value,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCallEnvelope {
    pub fn from_calls(calls: &[ToolCall]) -> Self {
        Self {
            tool_calls: calls
                .iter()
                .map(|c| EnvelopeCall {
                    id: c.id.clone(),
                    call_type: default_call_type(),
                    function: EnvelopeFunction {
                        name: c.name.clone(),
                        arguments: Value::String(c.arguments.to_string()),
                    },
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| json!({ ENVELOPE_MARKER: [] }).to_string())
    }

    /// Decodes string arguments. Undecodable arguments become an empty object.
    pub fn into_tool_calls(self) -> Vec<ToolCall> {
        self.tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: decode_arguments(c.function.arguments),
            })
            .collect()
    }
}

fn decode_arguments(raw: Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({})),
        Value::Object(_) => raw,
        _ => json!({}),
    }
}

/// Best-effort detection of a tool-call envelope in a model response.
///
/// Anything that is not a JSON object carrying a non-empty `tool_calls` list of
/// well-formed entries is an ordinary answer and yields `None`.
pub fn try_parse_tool_envelope(text: &str) -> Option<ToolCallEnvelope> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    if !value.get(ENVELOPE_MARKER).is_some_and(Value::is_array) {
        return None;
    }
    let envelope: ToolCallEnvelope = serde_json::from_value(value).ok()?;
    if envelope.tool_calls.is_empty() {
        return None;
    }
    Some(envelope)
}
