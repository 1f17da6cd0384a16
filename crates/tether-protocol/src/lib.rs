//! Wire protocol types for the agent stdio bridge.
//!
//! The supervised agent process speaks newline-delimited JSON on its standard
//! streams:
//!
//! ```text
//! tetherd --> agent (stdin):  {"id":"req-7","type":"prompt","message":"..."}
//! agent --> tetherd (stdout): {"id":"req-7","type":"response","success":true,"data":{...}}
//!                             {"type":"turn_end","data":{...}}          (unsolicited event)
//! ```
//!
//! Anything that is not a `type == "response"` object is treated as an
//! unsolicited event. Malformed lines are the caller's problem to surface;
//! classification never panics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reply to a request the bridge sent, matched back by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    pub id: Option<String>,
    /// Command name the agent echoes back. Informational only.
    pub command: Option<String>,
    /// A missing `success` field counts as success; only an explicit
    /// `false` marks the call as failed.
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Unsolicited message pushed by the agent between responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    /// Event name from the `type` field, `"unknown"` when absent.
    pub event_type: String,
    pub data: Option<Value>,
}

/// One classified line of agent stdout.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Response(AgentResponse),
    Event(AgentEvent),
}

impl AgentMessage {
    /// Classify a JSON line from the agent's stdout.
    ///
    /// A `type == "response"` object becomes [`AgentMessage::Response`];
    /// every other object becomes an [`AgentMessage::Event`] named after its
    /// `type` field.
    pub fn classify(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;

        if value.get("type").and_then(Value::as_str) == Some("response") {
            let response: AgentResponse = serde_json::from_value(value)?;
            return Ok(AgentMessage::Response(response));
        }

        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let data = value.get("data").cloned();
        Ok(AgentMessage::Event(AgentEvent { event_type, data }))
    }
}

/// Build one outbound request line: `{"id", "type": <command>, ...params}`.
///
/// Params are spliced into the top level of the envelope, matching what the
/// agent expects. The reserved `id` and `type` fields always win over a
/// params key of the same name.
pub fn request_line(
    id: &str,
    command: &str,
    params: Map<String, Value>,
) -> Result<String, serde_json::Error> {
    let mut envelope = Map::new();
    envelope.insert("id".to_string(), Value::String(id.to_string()));
    envelope.insert("type".to_string(), Value::String(command.to_string()));
    for (key, value) in params {
        if key != "id" && key != "type" {
            envelope.insert(key, value);
        }
    }
    serde_json::to_string(&Value::Object(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_envelope() {
        let mut params = Map::new();
        params.insert("message".to_string(), json!("hello"));

        let line = request_line("req-1", "prompt", params).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["id"], "req-1");
        assert_eq!(value["type"], "prompt");
        assert_eq!(value["message"], "hello");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_request_line_reserved_keys_win() {
        let mut params = Map::new();
        params.insert("id".to_string(), json!("spoofed"));
        params.insert("type".to_string(), json!("spoofed"));

        let line = request_line("req-2", "get_state", params).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["id"], "req-2");
        assert_eq!(value["type"], "get_state");
    }

    #[test]
    fn test_classify_response() {
        let line = r#"{"id":"req-1","type":"response","success":true,"data":{"model":"x"}}"#;
        match AgentMessage::classify(line).unwrap() {
            AgentMessage::Response(resp) => {
                assert_eq!(resp.id.as_deref(), Some("req-1"));
                assert!(resp.success);
                assert_eq!(resp.data.unwrap()["model"], "x");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_classify_response_failure() {
        let line = r#"{"id":"req-9","type":"response","success":false,"error":"no such model"}"#;
        match AgentMessage::classify(line).unwrap() {
            AgentMessage::Response(resp) => {
                assert!(!resp.success);
                assert_eq!(resp.error.as_deref(), Some("no such model"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_classify_response_missing_success_is_success() {
        let line = r#"{"id":"req-3","type":"response","data":{}}"#;
        match AgentMessage::classify(line).unwrap() {
            AgentMessage::Response(resp) => assert!(resp.success),
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_classify_event_with_type() {
        let line = r#"{"type":"turn_end","data":{"tokens":12}}"#;
        match AgentMessage::classify(line).unwrap() {
            AgentMessage::Event(event) => {
                assert_eq!(event.event_type, "turn_end");
                assert_eq!(event.data.unwrap()["tokens"], 12);
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_classify_event_without_type_is_unknown() {
        let line = r#"{"status":"warming up"}"#;
        match AgentMessage::classify(line).unwrap() {
            AgentMessage::Event(event) => {
                assert_eq!(event.event_type, "unknown");
                assert!(event.data.is_none());
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_classify_malformed_line() {
        assert!(AgentMessage::classify("not json").is_err());
    }
}
