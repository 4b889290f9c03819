//! WebSocket frames exchanged with clients

use crate::cache::CacheStats;
use crate::core::protocol::{RequestId, ToolDescriptor};
use crate::recovery::{ClassifiedError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming message from a client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke a tool; `id` is chosen by the client and echoed in the reply
    ToolCall {
        id: RequestId,
        tool: String,
        #[serde(default)]
        params: Value,
    },
    /// Re-send a delivered reply, or run the call again if there is none
    Retry {
        id: RequestId,
        tool: String,
        #[serde(default)]
        params: Value,
    },
    /// Answer to a `confirm_operation` request
    ConfirmResult {
        id: String,
        #[serde(default)]
        approved: bool,
    },
    Ping,
    ListTools,
    ReloadTools,
    CacheStats,
}

/// Reply to a single tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultFrame {
    pub id: RequestId,
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

impl ToolResultFrame {
    pub fn success(id: RequestId, tool: impl Into<String>, result: Value, cached: bool) -> Self {
        Self {
            id,
            tool: tool.into(),
            success: true,
            result: Some(result),
            error: None,
            error_type: None,
            suggestion: None,
            cached: cached.then_some(true),
        }
    }

    pub fn failure(id: RequestId, tool: impl Into<String>, error: &ClassifiedError) -> Self {
        Self {
            id,
            tool: tool.into(),
            success: false,
            result: None,
            error: Some(error.message.clone()),
            error_type: Some(error.kind),
            suggestion: Some(error.suggestion.clone()),
            cached: None,
        }
    }
}

/// Outgoing message to a client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection
    Connected {
        message: String,
        tools: Vec<ToolDescriptor>,
        connections: Vec<String>,
    },
    ToolResult(ToolResultFrame),
    Pong,
    ToolsList {
        tools: Vec<ToolDescriptor>,
    },
    CacheStats {
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<CacheStats>,
    },
    /// Sent to every client when a dangerous operation needs approval
    ConfirmOperation {
        id: String,
        operation: String,
        params: Value,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "tool_call", "id": "42", "tool": "list_directory", "params": {"path": "/tmp"}
        }))
        .unwrap();
        match msg {
            ClientMessage::ToolCall { id, tool, params } => {
                assert_eq!(id, RequestId::from("42"));
                assert_eq!(tool, "list_directory");
                assert_eq!(params["path"], "/tmp");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_kinds() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
        let list: ClientMessage = serde_json::from_str(r#"{"type":"list_tools"}"#).unwrap();
        assert!(matches!(list, ClientMessage::ListTools));
        let call: ClientMessage =
            serde_json::from_str(r#"{"type":"tool_call","id":7,"tool":"x"}"#).unwrap();
        assert!(matches!(call, ClientMessage::ToolCall { params: Value::Null, .. }));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"confirm_result"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_parse_confirm_result() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"confirm_result","id":"c-1","approved":true}"#).unwrap();
        match msg {
            ClientMessage::ConfirmResult { id, approved } => {
                assert_eq!(id, "c-1");
                assert!(approved);
            }
            other => panic!("unexpected {:?}", other),
        }
        let missing: ClientMessage =
            serde_json::from_str(r#"{"type":"confirm_result","id":"c-2"}"#).unwrap();
        assert!(matches!(missing, ClientMessage::ConfirmResult { approved: false, .. }));
    }

    #[test]
    fn test_confirm_operation_shape() {
        let frame = ServerMessage::ConfirmOperation {
            id: "c-1".to_string(),
            operation: "write_file".to_string(),
            params: json!({"path": "/a"}),
        };
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(
            value,
            json!({"type": "confirm_operation", "id": "c-1", "operation": "write_file", "params": {"path": "/a"}})
        );
        let error = ServerMessage::Error { message: "nope".to_string() };
        assert_eq!(error.to_text(), r#"{"type":"error","message":"nope"}"#);
    }

    #[test]
    fn test_tool_result_shape() {
        let frame = ServerMessage::ToolResult(ToolResultFrame::success(
            RequestId::from("42"),
            "list_directory",
            json!("a\nb"),
            false,
        ));
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_result", "id": "42", "tool": "list_directory", "success": true, "result": "a\nb"})
        );
    }

    #[test]
    fn test_failure_frame_carries_classification() {
        let classified = crate::recovery::ErrorClassifier::new().classify("request timed out after 5ms");
        let frame = ToolResultFrame::failure(RequestId::Number(1), "slow", &classified);
        let value = serde_json::to_value(ServerMessage::ToolResult(frame)).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errorType"], "TIMEOUT");
        assert!(value.get("result").is_none());
        assert!(value["suggestion"].is_string());
    }

    #[test]
    fn test_pong() {
        assert_eq!(ServerMessage::Pong.to_text(), r#"{"type":"pong"}"#);
    }
}
