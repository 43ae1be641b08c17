//! Outbound request builders and inbound frame parsing.
//!
//! Outbound requests are `{"id", "command", "params"}` objects. Several
//! requests flushed together travel as one batch envelope
//! `{"type": "batch", "requests": [...]}`.
//!
//! Inbound frames carry `{"id", "success", "data"?, "error"?}`. A frame may
//! also be a JSON array of replies or a `{"type": "batch", "responses": [...]}`
//! envelope; each element is handled on its own.

use serde::Deserialize;
use serde_json::{Value, json};

use super::RequestId;
use crate::bridge::request::Operation;
use crate::error::BridgeError;

/// Build the wire form of a single request.
pub(crate) fn build_request(id: RequestId, operation: &Operation) -> Value {
    json!({
        "id": id.to_string(),
        "command": operation.command,
        "params": operation.params,
    })
}

/// Wrap already-built requests into one batch message.
pub(crate) fn build_batch(requests: Vec<Value>) -> Value {
    json!({
        "type": "batch",
        "requests": requests,
    })
}

/// A correlated reply from the peer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reply {
    pub(crate) id: RequestId,
    /// `Ok(data)` for `success: true`, `Err(message)` otherwise
    pub(crate) outcome: Result<Value, String>,
}

/// One parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    /// Reply carrying an id this bridge issued
    Reply(Reply),
    /// Anything without a recognised id (progress events, selection changes, ...)
    Notification(Value),
}

#[derive(Debug, Deserialize)]
struct WireReply {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Parse one transport frame into its messages.
///
/// Never fails as a whole: every element that cannot be understood becomes
/// an `Err(BridgeError::Protocol)` entry so the caller can log it and keep
/// going with the rest.
pub(crate) fn parse_frame(frame: &str) -> Vec<Result<Inbound, BridgeError>> {
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(e) => {
            return vec![Err(BridgeError::protocol(format!(
                "unparseable frame: {}",
                e
            )))];
        }
    };

    match value {
        Value::Array(items) => items.into_iter().map(parse_message).collect(),
        Value::Object(ref object)
            if object.get("type").and_then(Value::as_str) == Some("batch") =>
        {
            match object.get("responses") {
                Some(Value::Array(items)) => items.iter().cloned().map(parse_message).collect(),
                _ => vec![Err(BridgeError::protocol(
                    "batch frame without a `responses` array",
                ))],
            }
        }
        Value::Object(_) => vec![parse_message(value)],
        other => vec![Err(BridgeError::protocol(format!(
            "expected a JSON object or array, got {}",
            other
        )))],
    }
}

fn parse_message(message: Value) -> Result<Inbound, BridgeError> {
    if !message.is_object() {
        return Err(BridgeError::protocol(format!(
            "expected a JSON object, got {}",
            message
        )));
    }

    let Some(id) = RequestId::from_json(&message) else {
        return Ok(Inbound::Notification(message));
    };

    let reply: WireReply = serde_json::from_value(message)
        .map_err(|e| BridgeError::protocol(format!("malformed reply for {}: {}", id, e)))?;

    let outcome = if reply.success {
        Ok(reply.data.unwrap_or(Value::Null))
    } else {
        Err(error_message(reply.error))
    };

    Ok(Inbound::Reply(Reply { id, outcome }))
}

/// Pull a human-readable message out of the `error` field.
///
/// Peers send either a plain string or an object with a `message` member.
fn error_message(error: Option<Value>) -> String {
    match error {
        Some(Value::String(message)) => message,
        Some(Value::Object(object)) => match object.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => Value::Object(object).to_string(),
        },
        Some(Value::Null) | None => "peer reported failure without a message".to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ULID: &str = "01JPMQ8ZYYQA1W3AVPW4JDRZFR";
    const TEST_ULID_2: &str = "01JPMQ8ZYYQA1W3AVPW4JDRZFS";

    fn id(s: &str) -> RequestId {
        s.parse().unwrap()
    }

    #[test]
    fn build_request_carries_id_command_and_params() {
        let operation = Operation::new("get_node_info", json!({"nodeId": "1:2"}));
        let request = build_request(id(TEST_ULID), &operation);

        assert_eq!(request["id"], TEST_ULID);
        assert_eq!(request["command"], "get_node_info");
        assert_eq!(request["params"]["nodeId"], "1:2");
    }

    #[test]
    fn build_batch_wraps_requests_in_order() {
        let batch = build_batch(vec![json!({"id": "a"}), json!({"id": "b"})]);
        assert_eq!(batch["type"], "batch");
        assert_eq!(batch["requests"][0]["id"], "a");
        assert_eq!(batch["requests"][1]["id"], "b");
    }

    #[test]
    fn parses_success_reply() {
        let frame = json!({"id": TEST_ULID, "success": true, "data": {"name": "Frame 1"}});
        let parsed = parse_frame(&frame.to_string());

        assert_eq!(
            parsed,
            vec![Ok(Inbound::Reply(Reply {
                id: id(TEST_ULID),
                outcome: Ok(json!({"name": "Frame 1"})),
            }))]
        );
    }

    #[test]
    fn success_without_data_is_null() {
        let frame = json!({"id": TEST_ULID, "success": true});
        let parsed = parse_frame(&frame.to_string());

        let Ok(Inbound::Reply(reply)) = &parsed[0] else {
            panic!("expected reply, got {:?}", parsed);
        };
        assert_eq!(reply.outcome, Ok(Value::Null));
    }

    #[test]
    fn parses_error_reply_with_string_error() {
        let frame = json!({"id": TEST_ULID, "success": false, "error": "Node not found"});
        let parsed = parse_frame(&frame.to_string());

        let Ok(Inbound::Reply(reply)) = &parsed[0] else {
            panic!("expected reply, got {:?}", parsed);
        };
        assert_eq!(reply.outcome, Err("Node not found".to_string()));
    }

    #[test]
    fn parses_error_reply_with_object_error() {
        let frame = json!({
            "id": TEST_ULID,
            "success": false,
            "error": {"code": 404, "message": "Node not found"}
        });
        let parsed = parse_frame(&frame.to_string());

        let Ok(Inbound::Reply(reply)) = &parsed[0] else {
            panic!("expected reply, got {:?}", parsed);
        };
        assert_eq!(reply.outcome, Err("Node not found".to_string()));
    }

    #[test]
    fn error_reply_without_message_gets_placeholder() {
        let frame = json!({"id": TEST_ULID, "success": false});
        let parsed = parse_frame(&frame.to_string());

        let Ok(Inbound::Reply(reply)) = &parsed[0] else {
            panic!("expected reply, got {:?}", parsed);
        };
        assert_eq!(
            reply.outcome,
            Err("peer reported failure without a message".to_string())
        );
    }

    #[test]
    fn message_without_id_is_notification() {
        let frame = json!({"type": "progress_update", "progress": 40});
        let parsed = parse_frame(&frame.to_string());

        assert_eq!(
            parsed,
            vec![Ok(Inbound::Notification(
                json!({"type": "progress_update", "progress": 40})
            ))]
        );
    }

    #[test]
    fn unparseable_frame_is_protocol_error() {
        let parsed = parse_frame("{not json");
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Err(BridgeError::Protocol { .. })));
    }

    #[test]
    fn reply_without_success_flag_is_protocol_error() {
        let frame = json!({"id": TEST_ULID, "data": 1});
        let parsed = parse_frame(&frame.to_string());
        assert!(matches!(parsed[0], Err(BridgeError::Protocol { .. })));
    }

    #[test]
    fn array_frame_is_split_per_element() {
        let frame = json!([
            {"id": TEST_ULID, "success": true, "data": 1},
            "garbage",
            {"id": TEST_ULID_2, "success": false, "error": "boom"},
        ]);
        let parsed = parse_frame(&frame.to_string());

        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[0], Ok(Inbound::Reply(_))));
        assert!(matches!(parsed[1], Err(BridgeError::Protocol { .. })));
        assert!(matches!(parsed[2], Ok(Inbound::Reply(_))));
    }

    #[test]
    fn batch_envelope_frame_is_split_per_element() {
        let frame = json!({
            "type": "batch",
            "responses": [
                {"id": TEST_ULID, "success": true},
                {"id": TEST_ULID_2, "success": true},
            ]
        });
        let parsed = parse_frame(&frame.to_string());
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|item| matches!(item, Ok(Inbound::Reply(_)))));
    }

    #[test]
    fn scalar_frame_is_protocol_error() {
        let parsed = parse_frame("42");
        assert!(matches!(parsed[0], Err(BridgeError::Protocol { .. })));
    }
}
